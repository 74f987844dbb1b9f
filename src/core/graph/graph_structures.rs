use rustc_hash::FxHashMap;

/// Undirected weighted graph stored as adjacency lists
///
/// ### Fields
///
/// * `neighbours` - For every node the indices of its neighbours.
/// * `weights` - For every node the edge weights, aligned with
///   `neighbours`.
#[derive(Clone, Debug)]
pub struct SparseGraph {
    neighbours: Vec<Vec<usize>>,
    weights: Vec<Vec<f32>>,
}

impl SparseGraph {
    /// Generate a graph from an edge list
    ///
    /// Parallel edges are merged by summing their weights. Self loops are
    /// dropped.
    ///
    /// ### Params
    ///
    /// * `n` - Number of nodes.
    /// * `edges` - Slice of `(from, to, weight)`.
    pub fn from_edges(n: usize, edges: &[(usize, usize, f32)]) -> Self {
        let mut adj: Vec<FxHashMap<usize, f32>> = vec![FxHashMap::default(); n];
        for &(a, b, w) in edges {
            if a == b {
                continue;
            }
            *adj[a].entry(b).or_insert(0.0) += w;
            *adj[b].entry(a).or_insert(0.0) += w;
        }

        let mut neighbours = Vec::with_capacity(n);
        let mut weights = Vec::with_capacity(n);
        for node in adj {
            let mut pairs: Vec<(usize, f32)> = node.into_iter().collect();
            pairs.sort_unstable_by_key(|&(idx, _)| idx);
            let (nb, ws): (Vec<usize>, Vec<f32>) = pairs.into_iter().unzip();
            neighbours.push(nb);
            weights.push(ws);
        }

        Self {
            neighbours,
            weights,
        }
    }

    /// Number of nodes in the graph
    pub fn get_node_number(&self) -> usize {
        self.neighbours.len()
    }

    /// Neighbours and weights of a node
    pub fn get_neighbours(&self, node: usize) -> (&[usize], &[f32]) {
        (&self.neighbours[node], &self.weights[node])
    }
}

/// Transform a kNN graph into an undirected sparse graph
///
/// Every neighbour relation becomes an edge with weight 1. Mutual neighbours
/// end up with weight 2.
///
/// ### Params
///
/// * `knn` - The kNN indices per node.
///
/// ### Returns
///
/// The `SparseGraph`
pub fn knn_to_sparse_graph(knn: &[Vec<usize>]) -> SparseGraph {
    let edges: Vec<(usize, usize, f32)> = knn
        .iter()
        .enumerate()
        .flat_map(|(i, neighbours)| neighbours.iter().map(move |&j| (i, j, 1.0_f32)))
        .collect();

    SparseGraph::from_edges(knn.len(), &edges)
}

///////////
// Tests //
///////////
