use rand::prelude::*;

use crate::core::graph::graph_structures::*;

/////////////
// Helpers //
/////////////

/// Bookkeeping of the local moving phase
///
/// ### Fields
///
/// * `membership` - Community per node.
/// * `degrees` - Weighted degree per node.
/// * `community_degrees` - Sum of the node degrees per community.
/// * `links` - Scratch space. Edge weight from the current node into each
///   community.
/// * `touched` - Communities with non-zero `links` for the current node.
struct LocalMoving {
    membership: Vec<usize>,
    degrees: Vec<f32>,
    community_degrees: Vec<f32>,
    links: Vec<f32>,
    touched: Vec<usize>,
}

impl LocalMoving {
    fn new(graph: &SparseGraph) -> Self {
        let n = graph.get_node_number();
        let degrees: Vec<f32> = (0..n)
            .map(|i| graph.get_neighbours(i).1.iter().sum::<f32>())
            .collect();
        Self {
            membership: (0..n).collect(),
            community_degrees: degrees.clone(),
            degrees,
            links: vec![0.0; n],
            touched: Vec::with_capacity(64),
        }
    }

    /// Try to move `node` into the neighbouring community with the largest
    /// modularity gain. Returns whether the node moved.
    fn move_node(&mut self, graph: &SparseGraph, node: usize, gamma: f32) -> bool {
        let current = self.membership[node];
        let k_i = self.degrees[node];

        let (neighbours, weights) = graph.get_neighbours(node);
        for (&nb, &w) in neighbours.iter().zip(weights) {
            let c = self.membership[nb];
            if self.links[c] == 0.0 {
                self.touched.push(c);
            }
            self.links[c] += w;
        }

        // node removed from its own community before the comparison
        let gain = |links: f32, comm_degree: f32| links - k_i * gamma * comm_degree;
        let mut best = current;
        let mut best_gain = gain(
            self.links[current],
            self.community_degrees[current] - k_i,
        );
        for &c in &self.touched {
            if c == current {
                continue;
            }
            let g = gain(self.links[c], self.community_degrees[c]);
            if g > best_gain + 1e-10 {
                best_gain = g;
                best = c;
            }
        }

        for &c in &self.touched {
            self.links[c] = 0.0;
        }
        self.touched.clear();

        if best == current {
            return false;
        }
        self.membership[node] = best;
        self.community_degrees[current] -= k_i;
        self.community_degrees[best] += k_i;
        true
    }

    /// Community labels `0..n_communities` in order of first appearance
    fn into_labels(self) -> Vec<usize> {
        let mut mapping = vec![usize::MAX; self.membership.len()];
        let mut next = 0;
        self.membership
            .into_iter()
            .map(|c| {
                if mapping[c] == usize::MAX {
                    mapping[c] = next;
                    next += 1;
                }
                mapping[c]
            })
            .collect()
    }
}

///////////////////////////
// Louvain - SparseGraph //
///////////////////////////

/// Louvain community detection (local moving phase)
///
/// ### Params
///
/// * `graph` - Undirected weighted graph
/// * `resolution` - Resolution parameter for the Louvain clustering
/// * `max_iter` - Maximum number of passes over all nodes
/// * `seed` - Seed for the node order
///
/// ### Returns
///
/// Vector of communities, labelled `0..n_communities` in order of first
/// appearance.
pub fn louvain_sparse_graph(
    graph: &SparseGraph,
    resolution: f32,
    max_iter: usize,
    seed: u64,
) -> Vec<usize> {
    let n = graph.get_node_number();
    let mut state = LocalMoving::new(graph);

    let total_weight: f32 = state.degrees.iter().sum();
    // no edges, every node is its own community
    if n == 0 || total_weight <= 0.0 {
        return state.into_labels();
    }
    let gamma = resolution / total_weight;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..n).collect();

    for _ in 0..max_iter {
        order.shuffle(&mut rng);
        let mut moved = 0;
        for &node in &order {
            if state.move_node(graph, node, gamma) {
                moved += 1;
            }
        }
        if moved == 0 {
            break;
        }
    }

    state.into_labels()
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn count_communities(communities: &[usize]) -> usize {
        let mut unique_communities: Vec<usize> = communities.to_vec();
        unique_communities.sort_unstable();
        unique_communities.dedup();
        unique_communities.len()
    }

    /// Ring of cliques with weak links between them
    fn generate_ring_of_cliques(num_cliques: usize, clique_size: usize) -> SparseGraph {
        let mut edges = Vec::new();
        for clique_id in 0..num_cliques {
            let start = clique_id * clique_size;
            for i in start..(start + clique_size) {
                for j in (i + 1)..(start + clique_size) {
                    edges.push((i, j, 1.0));
                }
            }
            let next = ((clique_id + 1) % num_cliques) * clique_size;
            edges.push((start + clique_size - 1, next, 0.1));
        }
        SparseGraph::from_edges(num_cliques * clique_size, &edges)
    }

    #[test]
    fn test_louvain_ring_of_cliques() {
        let graph = generate_ring_of_cliques(4, 6);
        let communities = louvain_sparse_graph(&graph, 1.0, 20, 42);

        assert_eq!(communities.len(), 24);
        assert_eq!(count_communities(&communities), 4);
        for clique in 0..4 {
            let first = communities[clique * 6];
            assert!(communities[clique * 6..(clique + 1) * 6]
                .iter()
                .all(|&c| c == first));
        }
    }

    #[test]
    fn test_louvain_deterministic() {
        let graph = generate_ring_of_cliques(3, 5);
        let a = louvain_sparse_graph(&graph, 1.0, 20, 7);
        let b = louvain_sparse_graph(&graph, 1.0, 20, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn test_louvain_empty_graph() {
        let graph = SparseGraph::from_edges(3, &[]);
        assert_eq!(louvain_sparse_graph(&graph, 1.0, 10, 1), vec![0, 1, 2]);
    }
}
