use faer::{concat, Mat, MatRef};
use log::{debug, info};
use rand::prelude::*;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::time::Instant;

use crate::core::base::pca_svd::{pca_with_stats, scale_with_stats, PcaWithStats};
use crate::core::base::stats::hypergeom_pval;
use crate::core::data::expression_matrix::ExpressionMatrix;
use crate::core::graph::community_detection::louvain_sparse_graph;
use crate::core::graph::graph_structures::knn_to_sparse_graph;
use crate::core::graph::knn::{generate_knn_exact, parse_knn_dist};
use crate::error::{check_open_unit, ConfigError, DetectorError};
use crate::single_cell::processing::*;
use crate::utils::general::cmp_f32;
use crate::utils::traits::EnsembleDoubletDetector;

/// Resolution multipliers of the clustering ensemble
const ENSEMBLE_RESOLUTIONS: [f32; 3] = [0.5, 1.0, 2.0];

////////////////////////
// Params and results //
////////////////////////

/// Structure to store the Boost parameters
///
/// ### Fields
///
/// **General parameters:**
///
/// * `log_transform` - Shall the counts be log-transformed
/// * `standard_scaling` - Scale every gene to unit variance before the PCA.
///   The data is mean-centred regardless.
/// * `target_size` - Optional target size. If not provided, will default to
///   the mean library size of the cells over the highly variable genes.
///
/// **HVG Detection:**
///
/// * `min_gene_var_pctl` - Percentile threshold (0 to 100) for highly
///   variable genes.
/// * `hvg_method` - Method for HVG selection. One of `"vst"` or
///   `"dispersion"`.
/// * `loess_span` - Span parameter for loess fitting in VST method.
///
/// **Doublet Generation:**
///
/// * `boost_rate` - Number of doublets to simulate relative to the number of
///   observed cells.
/// * `replace` - Whether to use replacement when sampling cell pairs.
///
/// **PCA:**
///
/// * `no_pcs` - Number of principal components to use for embedding.
/// * `random_svd` - Whether to use randomised SVD vs exact SVD.
///
/// **Clustering and Iteration:**
///
/// * `resolution` - Resolution parameter for Louvain clustering.
/// * `louvain_iters` - Maximum passes of the Louvain local moving phase.
/// * `use_clustering_ensemble` - Cluster with several resolutions per
///   iteration and keep the most significant enrichment per cell.
/// * `n_iters` - Number of boosting iterations to perform.
///
/// **kNN Graph:**
///
/// * `k` - Number of nearest neighbours for the kNN graph. If 0 (default),
///   automatically calculated as round(0.5 * sqrt(n_cells)).
/// * `dist_metric` - Distance metric to use. One of `"euclidean"` or
///   `"cosine"`.
///
/// **Reproducibility:**
///
/// * `seed` - Base seed. Iteration `i` uses `seed + i`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BoostParams {
    // general params
    pub log_transform: bool,
    pub standard_scaling: bool,
    pub target_size: Option<f32>,
    // hvg detection
    pub min_gene_var_pctl: f32,
    pub hvg_method: String,
    pub loess_span: f64,
    // doublet generation
    pub boost_rate: f32,
    pub replace: bool,
    // pca
    pub no_pcs: usize,
    pub random_svd: bool,
    // clustering
    pub resolution: f32,
    pub louvain_iters: usize,
    pub use_clustering_ensemble: bool,
    // iterations
    pub n_iters: usize,
    // knn
    pub k: usize,
    pub dist_metric: String,
    pub seed: u64,
}

impl Default for BoostParams {
    fn default() -> Self {
        Self {
            log_transform: true,
            standard_scaling: false,
            target_size: None,
            min_gene_var_pctl: 85.0,
            hvg_method: "vst".to_string(),
            loess_span: 0.3,
            boost_rate: 0.25,
            replace: false,
            no_pcs: 30,
            random_svd: false,
            resolution: 1.0,
            louvain_iters: 10,
            use_clustering_ensemble: false,
            n_iters: 10,
            k: 0,
            dist_metric: "euclidean".to_string(),
            seed: 0,
        }
    }
}

impl BoostParams {
    /// Check the parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_iters == 0 {
            return Err(ConfigError::OutOfRange {
                name: "n_iters",
                value: 0.0,
                range: "[1, inf)",
            });
        }
        if !(self.boost_rate > 0.0 && self.boost_rate.is_finite()) {
            return Err(ConfigError::OutOfRange {
                name: "boost_rate",
                value: self.boost_rate as f64,
                range: "(0, inf)",
            });
        }
        if !self.replace && self.boost_rate > 0.5 {
            return Err(ConfigError::OutOfRange {
                name: "boost_rate",
                value: self.boost_rate as f64,
                range: "(0, 0.5] without replacement",
            });
        }
        if !(0.0..=100.0).contains(&self.min_gene_var_pctl) {
            return Err(ConfigError::OutOfRange {
                name: "min_gene_var_pctl",
                value: self.min_gene_var_pctl as f64,
                range: "[0, 100]",
            });
        }
        if !(self.resolution > 0.0 && self.resolution.is_finite()) {
            return Err(ConfigError::OutOfRange {
                name: "resolution",
                value: self.resolution as f64,
                range: "(0, inf)",
            });
        }
        if self.no_pcs == 0 {
            return Err(ConfigError::OutOfRange {
                name: "no_pcs",
                value: 0.0,
                range: "[1, inf)",
            });
        }
        parse_hvg_method(&self.hvg_method)?;
        parse_knn_dist(&self.dist_metric)?;
        Ok(())
    }
}

/// Result structure for Boost doublet detection
///
/// ### Fields
///
/// * `predicted_doublets` - Boolean vector indicating which observed cells are
///   predicted as doublets (true = doublet, false = singlet).
/// * `doublet_scores` - Fraction of simulated doublets in the community of
///   each cell, averaged across iterations.
/// * `voting_average` - Fraction of iterations in which the cell was
///   significantly enriched. All zero for a single iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct BoostResult {
    pub predicted_doublets: Vec<bool>,
    pub doublet_scores: Vec<f32>,
    pub voting_average: Vec<f32>,
}

/// Per-iteration scores and log p-values of a fitted classifier
#[derive(Clone, Debug)]
struct BoostFit {
    all_scores: Vec<Vec<f32>>,
    all_log_p_values: Vec<Vec<f32>>,
}

/////////////
// Helpers //
/////////////

/// Score communities based on synthetic doublet enrichment
///
/// ### Params
///
/// * `orig_communities` - Community assignments for observed cells.
/// * `synth_communities` - Community assignments for simulated doublets.
///
/// ### Returns
///
/// Tuple of (enrichment scores, log p-values) for each observed cell.
fn score_communities(
    orig_communities: &[usize],
    synth_communities: &[usize],
) -> (Vec<f32>, Vec<f32>) {
    let mut synth_counts: FxHashMap<usize, usize> = FxHashMap::default();
    let mut orig_counts: FxHashMap<usize, usize> = FxHashMap::default();

    for &c in synth_communities {
        *synth_counts.entry(c).or_insert(0) += 1;
    }
    for &c in orig_communities {
        *orig_counts.entry(c).or_insert(0) += 1;
    }

    let mut comm_scores: FxHashMap<usize, f32> = FxHashMap::default();
    let mut comm_log_p: FxHashMap<usize, f32> = FxHashMap::default();

    for (&c, &n_orig) in &orig_counts {
        let n_synth = synth_counts.get(&c).copied().unwrap_or(0);
        let cluster_size = n_synth + n_orig;

        comm_scores.insert(c, n_synth as f32 / cluster_size as f32);

        let log_p = hypergeom_pval(
            n_synth,
            synth_communities.len(),
            orig_communities.len(),
            cluster_size,
        )
        .ln() as f32;
        comm_log_p.insert(c, log_p);
    }

    let scores: Vec<f32> = orig_communities.iter().map(|c| comm_scores[c]).collect();
    let log_p_values: Vec<f32> = orig_communities.iter().map(|c| comm_log_p[c]).collect();

    (scores, log_p_values)
}

/// Predict doublets via voting across iterations
///
/// ### Params
///
/// * `all_log_p_values` - Log p-values for each cell across all iterations.
/// * `p_thresh` - P-value threshold for significance in each iteration.
/// * `voter_thresh` - Fraction threshold for majority voting (0-1).
///
/// ### Returns
///
/// Tuple of (doublet predictions, average voting fraction) for each cell.
fn predict_voting(
    all_log_p_values: &[Vec<f32>],
    p_thresh: f32,
    voter_thresh: f32,
) -> (Vec<bool>, Vec<f32>) {
    let n_iters = all_log_p_values.len();
    let n_cells = all_log_p_values.first().map(|v| v.len()).unwrap_or(0);
    let log_p_thresh = p_thresh.ln();

    let voting_avg: Vec<f32> = (0..n_cells)
        .map(|cell_idx| {
            let votes: usize = all_log_p_values
                .iter()
                .filter(|iter_vals| iter_vals[cell_idx] <= log_p_thresh)
                .count();
            votes as f32 / n_iters as f32
        })
        .collect();

    let labels: Vec<bool> = voting_avg.iter().map(|&avg| avg >= voter_thresh).collect();

    (labels, voting_avg)
}

/// Find score cutoff using largest gap heuristic
///
/// ### Params
///
/// * `scores` - Community enrichment scores.
///
/// ### Returns
///
/// The score above the largest gap in the sorted scores. Infinite (nothing
/// called) if all scores are identical.
fn find_score_cutoff(scores: &[f32]) -> f32 {
    let mut sorted = scores.to_vec();
    sorted.sort_by(cmp_f32);

    let mut max_gap = 0.0f32;
    let mut cutoff = f32::INFINITY;

    for pair in sorted.windows(2) {
        let gap = pair[1] - pair[0];
        if gap > max_gap {
            max_gap = gap;
            cutoff = pair[1];
        }
    }

    cutoff
}

//////////
// Main //
//////////

/// Structure for Boost doublet detection algorithm
///
/// Each iteration simulates a small set of doublets, embeds them together
/// with the observed cells, clusters the joint kNN graph and tests each
/// community for enrichment of simulated doublets. Fitted results are kept
/// so `predict` can be called repeatedly with different thresholds.
///
/// ### Fields
///
/// * `params` - The Boost parameters
/// * `fitted` - Per-iteration results after `fit`.
#[derive(Clone, Debug)]
pub struct BoostClassifier {
    params: BoostParams,
    fitted: Option<BoostFit>,
}

impl BoostClassifier {
    /// Generate a new instance
    ///
    /// ### Params
    ///
    /// * `params` - The Boost parameters to use.
    pub fn new(params: BoostParams) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(BoostClassifier {
            params,
            fitted: None,
        })
    }

    /// Whether `fit` has been run
    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    /// Fit the classifier
    ///
    /// Identifies the highly variable genes once, then runs all iterations.
    ///
    /// ### Params
    ///
    /// * `matrix` - Expression matrix with raw counts.
    pub fn fit(&mut self, matrix: &ExpressionMatrix) -> Result<(), DetectorError> {
        let start_all = Instant::now();
        let n_cells = matrix.n_cells();
        if n_cells < 2 {
            return Err(DetectorError::InsufficientCells {
                found: n_cells,
                required: 2,
            });
        }

        let counts = matrix.counts();
        let start_hvg = Instant::now();
        let genes = filter_genes(counts, 1.0, 1);
        if genes.is_empty() {
            return Err(DetectorError::NoGenes { min_cells: 1 });
        }
        let full_lib_sizes = matrix.library_sizes();
        let hvg_method = parse_hvg_method(&self.params.hvg_method)?;
        let hvg_genes = highly_variable_genes(
            counts,
            &genes,
            &full_lib_sizes,
            mean_library_size(&full_lib_sizes),
            hvg_method,
            self.params.loess_span,
            self.params.min_gene_var_pctl,
        )?;
        info!(
            "Using {} highly variable genes. Done in {:.2?}",
            hvg_genes.len(),
            start_hvg.elapsed()
        );

        let hvg_library_sizes: Vec<f32> = (0..n_cells)
            .map(|i| hvg_genes.iter().map(|&g| counts[(i, g)]).sum())
            .collect();
        let target_size = self
            .params
            .target_size
            .unwrap_or_else(|| mean_library_size(&hvg_library_sizes));

        let start_iters = Instant::now();
        let iter_results: Vec<(Vec<f32>, Vec<f32>)> = (0..self.params.n_iters)
            .map(|iter| {
                debug!(
                    "Running Boost iteration {} of {}",
                    iter + 1,
                    self.params.n_iters
                );
                self.one_iteration(
                    counts,
                    &hvg_genes,
                    &hvg_library_sizes,
                    target_size,
                    self.params.seed.wrapping_add(iter as u64),
                )
            })
            .collect::<Result<_, DetectorError>>()?;
        info!(
            "Completed {} iterations in {:.2?}",
            self.params.n_iters,
            start_iters.elapsed()
        );

        let (all_scores, all_log_p_values) = iter_results.into_iter().unzip();
        self.fitted = Some(BoostFit {
            all_scores,
            all_log_p_values,
        });

        info!("Fitted Boost classifier in {:.2?}", start_all.elapsed());

        Ok(())
    }

    /// Call doublets from the fitted iterations
    ///
    /// With several iterations cells are called by voting. A single iteration
    /// falls back to the largest gap in the score distribution.
    ///
    /// ### Params
    ///
    /// * `p_thresh` - P-value threshold per iteration.
    /// * `voter_thresh` - Fraction of iterations that need to be significant.
    ///
    /// ### Returns
    ///
    /// A `BoostResult` or `DetectorError::NotFitted`.
    pub fn predict(&self, p_thresh: f32, voter_thresh: f32) -> Result<BoostResult, DetectorError> {
        let fitted = self.fitted.as_ref().ok_or(DetectorError::NotFitted)?;
        check_open_unit("p_thresh", p_thresh as f64)?;
        if !(0.0..=1.0).contains(&voter_thresh) {
            return Err(ConfigError::OutOfRange {
                name: "voter_thresh",
                value: voter_thresh as f64,
                range: "[0, 1]",
            }
            .into());
        }

        let n_iters = fitted.all_scores.len();
        let n_cells = fitted.all_scores.first().map(|s| s.len()).unwrap_or(0);

        let result = if n_iters > 1 {
            let (labels, voting_avg) =
                predict_voting(&fitted.all_log_p_values, p_thresh, voter_thresh);

            let avg_scores: Vec<f32> = (0..n_cells)
                .map(|i| {
                    fitted.all_scores.iter().map(|iter| iter[i]).sum::<f32>() / n_iters as f32
                })
                .collect();

            BoostResult {
                predicted_doublets: labels,
                doublet_scores: avg_scores,
                voting_average: voting_avg,
            }
        } else {
            let scores = &fitted.all_scores[0];
            let cutoff = find_score_cutoff(scores);
            debug!("Score cutoff: {:.4}", cutoff);

            BoostResult {
                predicted_doublets: scores.iter().map(|&s| s >= cutoff).collect(),
                doublet_scores: scores.clone(),
                voting_average: vec![0.0; n_cells],
            }
        };

        let n_doublets = result.predicted_doublets.iter().filter(|&&d| d).count();
        info!(
            "Detected {} doublets ({:.1}%)",
            n_doublets,
            100.0 * n_doublets as f32 / n_cells.max(1) as f32
        );

        Ok(result)
    }

    /// Execute a single Boost iteration
    ///
    /// ### Returns
    ///
    /// Tuple of (community scores, log p-values) for each observed cell.
    fn one_iteration(
        &self,
        counts: MatRef<f32>,
        hvg_genes: &[usize],
        hvg_library_sizes: &[f32],
        target_size: f32,
        seed: u64,
    ) -> Result<(Vec<f32>, Vec<f32>), DetectorError> {
        let n_cells = counts.nrows();

        let sim = self.simulate_doublets(counts, hvg_genes, hvg_library_sizes, target_size, seed);
        let n_sim = sim.nrows();

        let obs = normalise_subset(
            counts,
            hvg_genes,
            hvg_library_sizes,
            target_size,
            self.params.log_transform,
        );
        let combined_pca = self.run_pca(obs.as_ref(), sim.as_ref(), seed)?;

        let start_graph = Instant::now();
        let dist = parse_knn_dist(&self.params.dist_metric)?;
        let k_adj = self.calculate_k_adj(n_cells, n_sim);
        let knn = generate_knn_exact(combined_pca.as_ref(), k_adj, dist);
        let graph = knn_to_sparse_graph(&knn);
        debug!(
            "Generated kNN graph with {} neighbours. Done in {:.2?}",
            k_adj,
            start_graph.elapsed()
        );

        let start_cluster = Instant::now();
        let resolutions: Vec<f32> = if self.params.use_clustering_ensemble {
            ENSEMBLE_RESOLUTIONS
                .iter()
                .map(|m| m * self.params.resolution)
                .collect()
        } else {
            vec![self.params.resolution]
        };

        let per_resolution: Vec<(Vec<f32>, Vec<f32>)> = resolutions
            .par_iter()
            .map(|&resolution| {
                let communities =
                    louvain_sparse_graph(&graph, resolution, self.params.louvain_iters, seed);
                score_communities(&communities[..n_cells], &communities[n_cells..])
            })
            .collect();
        debug!(
            "Scored communities of {} clustering(s). Done in {:.2?}",
            per_resolution.len(),
            start_cluster.elapsed()
        );

        // most significant enrichment per cell across the ensemble
        let mut best = per_resolution[0].clone();
        for (scores, log_p) in per_resolution.iter().skip(1) {
            for i in 0..n_cells {
                if log_p[i] < best.1[i] {
                    best.1[i] = log_p[i];
                    best.0[i] = scores[i];
                }
            }
        }

        Ok(best)
    }

    /// Simulate the normalised doublets of one iteration
    ///
    /// Without replacement every observed cell is used as parent at most
    /// once.
    ///
    /// ### Returns
    ///
    /// Matrix of shape `n_sim x hvg_genes.len()`
    fn simulate_doublets(
        &self,
        counts: MatRef<f32>,
        hvg_genes: &[usize],
        hvg_library_sizes: &[f32],
        target_size: f32,
        seed: u64,
    ) -> Mat<f32> {
        let n_cells = counts.nrows();
        let n_sim_doublets = ((n_cells as f32 * self.params.boost_rate) as usize).max(1);
        let mut rng = StdRng::seed_from_u64(seed);

        let pairs: Vec<(usize, usize)> = if self.params.replace {
            (0..n_sim_doublets)
                .map(|_| {
                    let i = rng.random_range(0..n_cells);
                    let j = rng.random_range(0..n_cells);
                    (i, j)
                })
                .collect()
        } else {
            let mut available: Vec<usize> = (0..n_cells).collect();
            available.shuffle(&mut rng);
            available
                .chunks_exact(2)
                .take(n_sim_doublets)
                .map(|chunk| (chunk[0], chunk[1]))
                .collect()
        };

        let log_transform = self.params.log_transform;
        Mat::from_fn(pairs.len(), hvg_genes.len(), |d, j| {
            let (a, b) = pairs[d];
            let g = hvg_genes[j];
            normalise_value(
                counts[(a, g)] + counts[(b, g)],
                hvg_library_sizes[a] + hvg_library_sizes[b],
                target_size,
                log_transform,
            )
        })
    }

    /// Run PCA on the observed cells and project the simulated ones
    ///
    /// ### Returns
    ///
    /// The PCA scores with the top rows representing the actual data and
    /// the bottom rows the simulated data.
    fn run_pca(
        &self,
        obs: MatRef<f32>,
        sim: MatRef<f32>,
        seed: u64,
    ) -> Result<Mat<f32>, DetectorError> {
        let pca_res: PcaWithStats = pca_with_stats(
            obs,
            self.params.no_pcs,
            self.params.random_svd,
            true,
            self.params.standard_scaling,
            seed,
        )?;

        let scaled_sim = scale_with_stats(
            sim,
            &pca_res.2,
            &pca_res.3,
            true,
            self.params.standard_scaling,
        );

        let pca_sim = &scaled_sim * &pca_res.1;
        Ok(concat![[pca_res.0], [pca_sim]])
    }

    /// Calculates the adjusted k based on number actual cells and simulated
    /// cells
    fn calculate_k_adj(&self, n_cells: usize, n_cells_sim: usize) -> usize {
        let k = if self.params.k == 0 {
            ((n_cells as f32).sqrt() * 0.5).round() as usize
        } else {
            self.params.k
        };

        let r = n_cells_sim as f32 / n_cells as f32;
        ((k as f32 * (1.0 + r)).round() as usize).max(1)
    }
}

impl EnsembleDoubletDetector for BoostClassifier {
    fn fit(&mut self, matrix: &ExpressionMatrix) -> Result<(), DetectorError> {
        BoostClassifier::fit(self, matrix)
    }

    fn predict(&self, p_thresh: f32, voter_thresh: f32) -> Result<BoostResult, DetectorError> {
        BoostClassifier::predict(self, p_thresh, voter_thresh)
    }
}

///////////
// Tests //
///////////
