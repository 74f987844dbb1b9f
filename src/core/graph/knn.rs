use faer::MatRef;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::ConfigError;

///////////
// Enums //
///////////

/// Distance metric for the nearest neighbour search
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KnnDist {
    /// Euclidean distance (squared, same rank order)
    Euclidean,
    /// Cosine distance, i.e. `1 - cosine similarity`
    Cosine,
}

/// Helper function to get the distance metric
///
/// ### Params
///
/// * `s` - Name of the distance metric
///
/// ### Returns
///
/// The `KnnDist` or a `ConfigError` for unknown metrics.
pub fn parse_knn_dist(s: &str) -> Result<KnnDist, ConfigError> {
    match s.to_lowercase().as_str() {
        "euclidean" => Ok(KnnDist::Euclidean),
        "cosine" => Ok(KnnDist::Cosine),
        _ => Err(ConfigError::InvalidOption {
            name: "dist_metric",
            value: s.to_string(),
        }),
    }
}

////////////////
// Structures //
////////////////

/// Helper struct for kNN with a max heap on the distance
///
/// ### Fields
///
/// * `index` - Index position of that neighbour
/// * `distance` - Distance to that neighbour
#[derive(Debug)]
struct DistanceItem {
    index: usize,
    distance: f32,
}

impl Eq for DistanceItem {}

impl PartialEq for DistanceItem {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.index == other.index
    }
}

/// Larger distances sit on top of the heap. Ties are broken by index so the
/// result does not depend on iteration order.
impl Ord for DistanceItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.index.cmp(&other.index))
    }
}

impl PartialOrd for DistanceItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/////////////
// Helpers //
/////////////

#[inline]
fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

#[inline]
fn cosine_distance(a: &[f32], b: &[f32], norm_a: f32, norm_b: f32) -> f32 {
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    1.0 - dot / (norm_a * norm_b)
}

////////////////////
// Main functions //
////////////////////

/// Generate the kNN graph with an exact search
///
/// All pairwise distances are evaluated, parallelised over the query rows.
///
/// ### Params
///
/// * `embd` - Matrix in which rows represent the samples and columns the
///   respective embeddings for that sample
/// * `k` - Number of neighbours. Capped at `n - 1`.
/// * `dist` - The distance metric to use.
///
/// ### Returns
///
/// The k-nearest neighbours for each sample, sorted from closest to furthest.
/// A sample is never its own neighbour.
pub fn generate_knn_exact(embd: MatRef<f32>, k: usize, dist: KnnDist) -> Vec<Vec<usize>> {
    let n = embd.nrows();
    if n < 2 {
        return vec![Vec::new(); n];
    }
    let k = k.min(n - 1);

    let rows: Vec<Vec<f32>> = (0..n)
        .map(|i| (0..embd.ncols()).map(|j| embd[(i, j)]).collect())
        .collect();
    let norms: Vec<f32> = rows
        .iter()
        .map(|r| r.iter().map(|v| v * v).sum::<f32>().sqrt())
        .collect();

    (0..n)
        .into_par_iter()
        .map(|i| {
            let mut heap = BinaryHeap::with_capacity(k + 1);

            for j in 0..n {
                if i == j {
                    continue;
                }
                let distance = match dist {
                    KnnDist::Euclidean => squared_euclidean(&rows[i], &rows[j]),
                    KnnDist::Cosine => cosine_distance(&rows[i], &rows[j], norms[i], norms[j]),
                };
                heap.push(DistanceItem { index: j, distance });
                if heap.len() > k {
                    heap.pop();
                }
            }

            heap.into_sorted_vec()
                .into_iter()
                .map(|item| item.index)
                .collect()
        })
        .collect()
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    fn create_clustered_data() -> Mat<f32> {
        // two well separated clusters of 20 points each
        Mat::from_fn(40, 2, |i, j| {
            let offset = if i < 20 { 0.0 } else { 10.0 };
            offset + ((i * (j + 3)) % 7) as f32 * 0.1
        })
    }

    #[test]
    fn test_no_self_neighbours() {
        let data = create_clustered_data();
        let knn = generate_knn_exact(data.as_ref(), 5, KnnDist::Euclidean);
        for (i, neighbours) in knn.iter().enumerate() {
            assert!(!neighbours.contains(&i), "Node {} found itself", i);
            assert_eq!(neighbours.len(), 5);
        }
    }

    #[test]
    fn test_cluster_structure() {
        let data = create_clustered_data();
        let knn = generate_knn_exact(data.as_ref(), 5, KnnDist::Euclidean);
        for (i, neighbours) in knn.iter().enumerate() {
            for &n in neighbours {
                assert_eq!(i < 20, n < 20, "Node {} has neighbour {} in other cluster", i, n);
            }
        }
    }

    #[test]
    fn test_sorted_by_distance() {
        let data = Mat::from_fn(5, 1, |i, _| (i * i) as f32);
        let knn = generate_knn_exact(data.as_ref(), 4, KnnDist::Euclidean);
        // point 0 at 0: closest 1 (1), then 4 (2), 9 (3), 16 (4)
        assert_eq!(knn[0], vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_k_is_capped() {
        let data = Mat::from_fn(3, 2, |i, j| (i + j) as f32);
        let knn = generate_knn_exact(data.as_ref(), 10, KnnDist::Cosine);
        assert!(knn.iter().all(|n| n.len() == 2));
    }

    #[test]
    fn test_parse_dist() {
        assert_eq!(parse_knn_dist("Euclidean").unwrap(), KnnDist::Euclidean);
        assert_eq!(parse_knn_dist("cosine").unwrap(), KnnDist::Cosine);
        assert!(parse_knn_dist("manhattan").is_err());
    }
}
