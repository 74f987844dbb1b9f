use faer::{concat, Mat, MatRef};
use log::{debug, info, warn};
use rand::prelude::*;
use rand_distr::Binomial;
use rayon::prelude::*;
use serde::Deserialize;
use std::time::Instant;

use crate::core::base::pca_svd::{pca_with_stats, scale_with_stats, PcaWithStats};
use crate::core::data::expression_matrix::ExpressionMatrix;
use crate::core::graph::knn::{generate_knn_exact, parse_knn_dist};
use crate::error::{check_open_unit, ConfigError, DetectorError};
use crate::single_cell::processing::*;
use crate::utils::general::{array_max_min, median_f32, moving_average};
use crate::utils::traits::DensityDoubletDetector;

///////////
// Types //
///////////

/// Type alias for Scrublet Doublet Scores
///
/// ### Fields
///
/// * `0` - Scores actual cells
/// * `1` - Errors actual cells
/// * `2` - Scores simulated cells
/// * `3` - Errors simulated cells
type ScrubletDoubletScores = (Vec<f32>, Vec<f32>, Vec<f32>, Vec<f32>);

////////////////////////
// Params and results //
////////////////////////

/// Structure that stores the Scrublet parameters that are set at
/// construction
///
/// ### Fields
///
/// * `expected_doublet_rate` - Prior for the fraction of doublets, `(0, 1)`.
/// * `stdev_doublet_rate` - Uncertainty of the expected doublet rate.
/// * `sim_doublet_ratio` - Number of doublets to simulate relative to the
///   number of observed cells.
/// * `k` - Number of neighbours. If 0, `round(0.5 * sqrt(n_cells))`.
/// * `n_bins` - Number of histogram bins for the automatic threshold.
/// * `seed` - Seed for the doublet simulation and randomised SVD.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScrubletParams {
    pub expected_doublet_rate: f32,
    pub stdev_doublet_rate: f32,
    pub sim_doublet_ratio: f32,
    pub k: usize,
    pub n_bins: usize,
    pub seed: u64,
}

impl Default for ScrubletParams {
    fn default() -> Self {
        Self {
            expected_doublet_rate: 0.1,
            stdev_doublet_rate: 0.02,
            sim_doublet_ratio: 2.0,
            k: 0,
            n_bins: 50,
            seed: 0,
        }
    }
}

impl ScrubletParams {
    /// Check the parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_open_unit("expected_doublet_rate", self.expected_doublet_rate as f64)?;
        if !(self.stdev_doublet_rate >= 0.0 && self.stdev_doublet_rate.is_finite()) {
            return Err(ConfigError::OutOfRange {
                name: "stdev_doublet_rate",
                value: self.stdev_doublet_rate as f64,
                range: "[0, inf)",
            });
        }
        if !(self.sim_doublet_ratio > 0.0 && self.sim_doublet_ratio.is_finite()) {
            return Err(ConfigError::OutOfRange {
                name: "sim_doublet_ratio",
                value: self.sim_doublet_ratio as f64,
                range: "(0, inf)",
            });
        }
        if self.n_bins < 2 {
            return Err(ConfigError::OutOfRange {
                name: "n_bins",
                value: self.n_bins as f64,
                range: "[2, inf)",
            });
        }
        Ok(())
    }
}

/// Parameters of the scoring path (preprocessing, embedding, neighbours)
///
/// ### Fields
///
/// * `min_counts` - Minimum UMI count for a cell to count as expressing a
///   gene.
/// * `min_cells` - Minimum number of expressing cells to keep a gene.
/// * `min_gene_var_pctl` - Percentile (0 to 100) of gene variability above
///   which genes are used.
/// * `no_pcs` - Number of principal components.
/// * `hvg_method` - One of `"vst"` or `"dispersion"`.
/// * `loess_span` - Span for the VST loess fit.
/// * `log_transform` - Log-transform the normalised counts.
/// * `mean_center` - Mean-centre before the PCA.
/// * `normalise_variance` - Variance-normalise before the PCA.
/// * `random_svd` - Use randomised SVD.
/// * `target_size` - Optional target library size. Defaults to the mean
///   library size.
/// * `dist_metric` - One of `"euclidean"` or `"cosine"`.
/// * `synthetic_doublet_umi_subsampling` - Rate `(0, 1]` at which UMIs of the
///   simulated doublets are subsampled.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScrubParams {
    pub min_counts: f32,
    pub min_cells: usize,
    pub min_gene_var_pctl: f32,
    pub no_pcs: usize,
    pub hvg_method: String,
    pub loess_span: f64,
    pub log_transform: bool,
    pub mean_center: bool,
    pub normalise_variance: bool,
    pub random_svd: bool,
    pub target_size: Option<f32>,
    pub dist_metric: String,
    pub synthetic_doublet_umi_subsampling: f32,
}

impl Default for ScrubParams {
    fn default() -> Self {
        Self {
            min_counts: 3.0,
            min_cells: 3,
            min_gene_var_pctl: 85.0,
            no_pcs: 30,
            hvg_method: "vst".to_string(),
            loess_span: 0.3,
            log_transform: false,
            mean_center: true,
            normalise_variance: true,
            random_svd: false,
            target_size: None,
            dist_metric: "euclidean".to_string(),
            synthetic_doublet_umi_subsampling: 1.0,
        }
    }
}

impl ScrubParams {
    /// Check the parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.min_gene_var_pctl) {
            return Err(ConfigError::OutOfRange {
                name: "min_gene_var_pctl",
                value: self.min_gene_var_pctl as f64,
                range: "[0, 100]",
            });
        }
        if self.no_pcs == 0 {
            return Err(ConfigError::OutOfRange {
                name: "no_pcs",
                value: 0.0,
                range: "[1, inf)",
            });
        }
        let rate = self.synthetic_doublet_umi_subsampling;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(ConfigError::OutOfRange {
                name: "synthetic_doublet_umi_subsampling",
                value: rate as f64,
                range: "(0, 1]",
            });
        }
        if let Some(t) = self.target_size {
            if !(t > 0.0 && t.is_finite()) {
                return Err(ConfigError::OutOfRange {
                    name: "target_size",
                    value: t as f64,
                    range: "(0, inf)",
                });
            }
        }
        parse_hvg_method(&self.hvg_method)?;
        parse_knn_dist(&self.dist_metric)?;
        Ok(())
    }
}

/// Result structure for Scrublet
///
/// All `*_obs` vectors and `predicted_doublets` are aligned to the rows of
/// the input matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct ScrubletResult {
    pub predicted_doublets: Vec<bool>,
    pub doublet_scores_obs: Vec<f32>,
    pub doublet_scores_sim: Vec<f32>,
    pub doublet_errors_obs: Vec<f32>,
    pub z_scores: Vec<f32>,
    pub threshold: f32,
    pub detected_doublet_rate: f32,
    pub detectable_doublet_fraction: f32,
    pub overall_doublet_rate: f32,
}

/////////////
// Helpers //
/////////////

/// Find the threshold between the two modes of the simulated scores
///
/// Histogram of the scores, smoothed with a moving average. The threshold is
/// the minimum of the histogram after the first peak. Falls back to the
/// median if no valley can be found.
///
/// ### Params
///
/// * `scores` - Doublet scores of the simulated doublets.
/// * `n_bins` - Number of histogram bins.
///
/// ### Returns
///
/// The threshold
pub fn find_threshold_min(scores: &[f32], n_bins: usize) -> f32 {
    if scores.is_empty() {
        return 0.0;
    }
    let (min_score, max_score) = array_max_min(scores);

    if (max_score - min_score).abs() < 1e-6 {
        return (min_score + max_score) / 2.0;
    }

    let bin_width = (max_score - min_score) / n_bins as f32;

    let mut hist = vec![0usize; n_bins];

    for &score in scores {
        let bin = ((score - min_score) / bin_width).floor() as usize;
        let bin = bin.min(n_bins - 1);
        hist[bin] += 1;
    }

    let smoothed = moving_average(&hist, 3);

    let max_count = *smoothed.iter().max().unwrap_or(&1);
    let threshold_count = (max_count as f32 * 0.1) as usize;

    let mut found_first_peak = false;
    let mut min_idx = 0;
    let mut min_val = usize::MAX;

    for (i, &smoothed_i) in smoothed.iter().enumerate() {
        if !found_first_peak {
            if smoothed_i > threshold_count {
                found_first_peak = true;
            }
        } else {
            if smoothed_i < min_val {
                min_idx = i;
                min_val = smoothed_i;
            }

            // stop at the next peak
            if smoothed_i > (min_val as f32 * 1.5) as usize {
                break;
            }
        }
    }

    if !found_first_peak || min_val == usize::MAX {
        return median_f32(scores);
    }

    min_score + (min_idx as f32 + 0.5) * bin_width
}

/// Bayesian doublet score per cell based on the simulated neighbours
///
/// ### Params
///
/// * `n_sim_neigh` - Number of simulated doublets among the neighbours.
/// * `n_neigh` - Total number of neighbours.
/// * `r` - Ratio of simulated to observed cells.
/// * `rho` - Expected doublet rate.
/// * `se_rho` - Standard error of the expected doublet rate.
///
/// ### Returns
///
/// Tuple of (score, standard error)
fn doublet_score(n_sim_neigh: f32, n_neigh: f32, r: f32, rho: f32, se_rho: f32) -> (f32, f32) {
    let q = (n_sim_neigh + 1.0) / (n_neigh + 2.0);
    let denominator = 1.0 - rho - q * (1.0 - rho - rho / r);
    let score = if denominator.abs() > 1e-10 {
        (q * rho / r) / denominator
    } else {
        0.0
    };

    let se_q = (q * (1.0 - q) / (n_neigh + 3.0)).sqrt();
    let factor = q * rho / r / (denominator * denominator);
    let se_score =
        factor * ((se_q / q * (1.0 - rho)).powi(2) + (se_rho / rho * (1.0 - q)).powi(2)).sqrt();

    (score.max(0.0), se_score.max(1e-10))
}

////////////////////
// Main structure //
////////////////////

/// Scrublet doublet detection
///
/// Doublets are simulated by adding up the counts of random pairs of
/// observed cells. Cells whose neighbourhood in PC space is enriched for
/// simulated doublets obtain high doublet scores.
///
/// ### Fields
///
/// * `matrix` - The observed expression matrix (raw counts).
/// * `params` - Construction parameters.
/// * `scrub_params` - Parameters of the scoring path.
/// * `scores` - Cached doublet scores of the last scoring run.
#[derive(Clone, Debug)]
pub struct Scrublet<'a> {
    matrix: &'a ExpressionMatrix,
    params: ScrubletParams,
    scrub_params: ScrubParams,
    scores: Option<ScrubletDoubletScores>,
}

impl<'a> Scrublet<'a> {
    /// Generate a new instance
    ///
    /// ### Params
    ///
    /// * `matrix` - The expression matrix with raw counts.
    /// * `params` - The `ScrubletParams`.
    /// * `scrub_params` - The `ScrubParams` used whenever scores have to be
    ///   calculated.
    pub fn new(
        matrix: &'a ExpressionMatrix,
        params: ScrubletParams,
        scrub_params: ScrubParams,
    ) -> Result<Self, ConfigError> {
        params.validate()?;
        scrub_params.validate()?;

        Ok(Scrublet {
            matrix,
            params,
            scrub_params,
            scores: None,
        })
    }

    /// Run the full Scrublet pipeline
    ///
    /// Scores are (re)calculated and doublets are called with an automatically
    /// determined threshold.
    pub fn scrub_doublets(&mut self) -> Result<ScrubletResult, DetectorError> {
        let start_all = Instant::now();

        let scores = self.calculate_doublet_scores()?;
        let res = self.call_with_threshold(&scores, None);
        self.scores = Some(scores);

        info!("Finished Scrublet in {:.2?}", start_all.elapsed());

        Ok(res)
    }

    /// Call doublets
    ///
    /// Reuses the scores of a previous run. If there are none, the scoring
    /// path is run first.
    ///
    /// ### Params
    ///
    /// * `threshold` - Manual threshold. If `None`, the threshold is
    ///   determined from the simulated doublet scores.
    pub fn call_doublets(&mut self, threshold: Option<f32>) -> Result<ScrubletResult, DetectorError> {
        let scores = match self.scores.take() {
            Some(scores) => scores,
            None => self.calculate_doublet_scores()?,
        };
        let res = self.call_with_threshold(&scores, threshold);
        self.scores = Some(scores);
        Ok(res)
    }

    /// Number of neighbours before adjusting for the simulated cells
    fn base_k(&self) -> usize {
        if self.params.k == 0 {
            (((self.matrix.n_cells() as f32).sqrt() * 0.5).round() as usize).max(1)
        } else {
            self.params.k
        }
    }

    /// Calculate the doublet scores of observed and simulated cells
    fn calculate_doublet_scores(&self) -> Result<ScrubletDoubletScores, DetectorError> {
        let n_obs = self.matrix.n_cells();
        if n_obs < 2 {
            return Err(DetectorError::InsufficientCells {
                found: n_obs,
                required: 2,
            });
        }

        let counts = self.matrix.counts();
        let lib_sizes = self.matrix.library_sizes();
        let target_size = self
            .scrub_params
            .target_size
            .unwrap_or_else(|| mean_library_size(&lib_sizes));

        // gene filtering and HVG
        let start_hvg = Instant::now();
        let genes = filter_genes(
            counts,
            self.scrub_params.min_counts,
            self.scrub_params.min_cells,
        );
        if genes.is_empty() {
            return Err(DetectorError::NoGenes {
                min_cells: self.scrub_params.min_cells,
            });
        }
        let hvg_method = parse_hvg_method(&self.scrub_params.hvg_method)?;
        let hvg_genes = highly_variable_genes(
            counts,
            &genes,
            &lib_sizes,
            target_size,
            hvg_method,
            self.scrub_params.loess_span,
            self.scrub_params.min_gene_var_pctl,
        )?;
        if hvg_genes.len() < 2 {
            warn!(
                "Only {} highly variable gene(s) available for Scrublet",
                hvg_genes.len()
            );
        }
        info!(
            "Using {} highly variable genes. Done in {:.2?}",
            hvg_genes.len(),
            start_hvg.elapsed()
        );

        // simulate doublets
        let start_sim = Instant::now();
        let sim = self.simulate_doublets(counts, &lib_sizes, &hvg_genes, target_size)?;
        let n_sim = sim.nrows();
        info!(
            "Simulated {} doublets. Done in {:.2?}",
            n_sim,
            start_sim.elapsed()
        );

        // PCA
        let start_pca = Instant::now();
        let obs = normalise_subset(
            counts,
            &hvg_genes,
            &lib_sizes,
            target_size,
            self.scrub_params.log_transform,
        );
        let combined_pca = self.run_pca(obs.as_ref(), sim.as_ref())?;
        info!("Done with PCA in {:.2?}", start_pca.elapsed());

        // kNN
        let start_knn = Instant::now();
        let dist = parse_knn_dist(&self.scrub_params.dist_metric)?;
        let r = n_sim as f32 / n_obs as f32;
        let k_adj = ((self.base_k() as f32 * (1.0 + r)).round() as usize).max(1);
        let knn_indices = generate_knn_exact(combined_pca.as_ref(), k_adj, dist);
        info!(
            "Using {} neighbours. Done with kNN generation in {:.2?}",
            k_adj,
            start_knn.elapsed()
        );

        let rho = self.params.expected_doublet_rate;
        let se_rho = self.params.stdev_doublet_rate;

        let scores_errors: Vec<(f32, f32)> = knn_indices
            .par_iter()
            .map(|neighbours| {
                let n_sim_neigh = neighbours.iter().filter(|&&idx| idx >= n_obs).count() as f32;
                doublet_score(n_sim_neigh, neighbours.len() as f32, r, rho, se_rho)
            })
            .collect();

        let (scores_obs, errors_obs): (Vec<f32>, Vec<f32>) =
            scores_errors[..n_obs].iter().copied().unzip();
        let (scores_sim, errors_sim): (Vec<f32>, Vec<f32>) =
            scores_errors[n_obs..].iter().copied().unzip();

        Ok((scores_obs, errors_obs, scores_sim, errors_sim))
    }

    /// Generate the normalised doublets
    ///
    /// Pairs of observed cells are drawn with replacement (a cell is never
    /// paired with itself). Raw counts and library sizes are added and
    /// optionally subsampled before normalisation.
    ///
    /// ### Returns
    ///
    /// Matrix of shape `n_sim x hvg_genes.len()`
    fn simulate_doublets(
        &self,
        counts: MatRef<f32>,
        lib_sizes: &[f32],
        hvg_genes: &[usize],
        target_size: f32,
    ) -> Result<Mat<f32>, DetectorError> {
        let n_obs = self.matrix.n_cells();
        let n_sim_doublets =
            ((n_obs as f32 * self.params.sim_doublet_ratio).round() as usize).max(1);
        let mut rng = StdRng::seed_from_u64(self.params.seed);

        let pairs: Vec<(usize, usize)> = (0..n_sim_doublets)
            .map(|_| {
                let i = rng.random_range(0..n_obs);
                let mut j = rng.random_range(0..n_obs - 1);
                if j >= i {
                    j += 1;
                }
                (i, j)
            })
            .collect();

        let rate = self.scrub_params.synthetic_doublet_umi_subsampling as f64;
        let subsample = rate < 1.0;

        let mut raw: Vec<Vec<f32>> = pairs
            .iter()
            .map(|&(i, j)| {
                hvg_genes
                    .iter()
                    .map(|&g| counts[(i, g)] + counts[(j, g)])
                    .collect()
            })
            .collect();
        let mut sim_lib: Vec<f32> = pairs
            .iter()
            .map(|&(i, j)| lib_sizes[i] + lib_sizes[j])
            .collect();

        if subsample {
            debug!("Subsampling UMIs of simulated doublets at rate {}", rate);
            for (row, lib) in raw.iter_mut().zip(sim_lib.iter_mut()) {
                for v in row.iter_mut() {
                    *v = binomial_sample(&mut rng, *v, rate)?;
                }
                *lib = binomial_sample(&mut rng, *lib, rate)?;
            }
        }

        let log_transform = self.scrub_params.log_transform;
        Ok(Mat::from_fn(n_sim_doublets, hvg_genes.len(), |i, j| {
            normalise_value(raw[i][j], sim_lib[i], target_size, log_transform)
        }))
    }

    /// Run the PCA on the observed cells and project the simulated ones
    ///
    /// ### Returns
    ///
    /// The PCA scores with the top rows representing the actual data and
    /// the bottom rows the simulated data.
    fn run_pca(&self, obs: MatRef<f32>, sim: MatRef<f32>) -> Result<Mat<f32>, DetectorError> {
        let pca_res: PcaWithStats = pca_with_stats(
            obs,
            self.scrub_params.no_pcs,
            self.scrub_params.random_svd,
            self.scrub_params.mean_center,
            self.scrub_params.normalise_variance,
            self.params.seed,
        )?;

        let scaled_sim = scale_with_stats(
            sim,
            &pca_res.2,
            &pca_res.3,
            self.scrub_params.mean_center,
            self.scrub_params.normalise_variance,
        );

        let pca_sim = &scaled_sim * &pca_res.1;

        Ok(concat![[pca_res.0], [pca_sim]])
    }

    /// Call doublets from the scores
    fn call_with_threshold(
        &self,
        doublet_scores: &ScrubletDoubletScores,
        manual_threshold: Option<f32>,
    ) -> ScrubletResult {
        let threshold = manual_threshold.unwrap_or_else(|| {
            let t = find_threshold_min(&doublet_scores.2, self.params.n_bins);
            info!("Automatically set threshold at doublet score = {:.4}", t);
            t
        });

        let predicted_doublets: Vec<bool> = doublet_scores
            .0
            .iter()
            .map(|&score| score > threshold)
            .collect();

        let z_scores: Vec<f32> = doublet_scores
            .0
            .iter()
            .zip(doublet_scores.1.iter())
            .map(|(&score, &error)| (score - threshold) / error)
            .collect();

        let n_detected = predicted_doublets.iter().filter(|&&x| x).count();
        let detected_doublet_rate = n_detected as f32 / doublet_scores.0.len() as f32;

        let n_detectable = doublet_scores.2.iter().filter(|&&s| s > threshold).count();
        let detectable_doublet_fraction = n_detectable as f32 / doublet_scores.2.len() as f32;

        let overall_doublet_rate = if detectable_doublet_fraction > 0.01 {
            detected_doublet_rate / detectable_doublet_fraction
        } else {
            0.0
        };

        info!(
            "Detected doublet rate = {:.1}%, estimated detectable doublet fraction = {:.1}%",
            100.0 * detected_doublet_rate,
            100.0 * detectable_doublet_fraction
        );
        info!(
            "Overall doublet rate: expected = {:.1}%, estimated = {:.1}%",
            100.0 * self.params.expected_doublet_rate,
            100.0 * overall_doublet_rate
        );

        ScrubletResult {
            predicted_doublets,
            doublet_scores_obs: doublet_scores.0.clone(),
            doublet_scores_sim: doublet_scores.2.clone(),
            doublet_errors_obs: doublet_scores.1.clone(),
            z_scores,
            threshold,
            detected_doublet_rate,
            detectable_doublet_fraction,
            overall_doublet_rate,
        }
    }
}

/// Binomial subsampling of a (whole number) count
fn binomial_sample(rng: &mut StdRng, count: f32, rate: f64) -> Result<f32, DetectorError> {
    let n = count.round().max(0.0) as u64;
    let dist = Binomial::new(n, rate).map_err(|e| {
        DetectorError::Config(ConfigError::InvalidOption {
            name: "synthetic_doublet_umi_subsampling",
            value: e.to_string(),
        })
    })?;
    Ok(dist.sample(rng) as f32)
}

impl DensityDoubletDetector for Scrublet<'_> {
    fn scrub_doublets(&mut self) -> Result<ScrubletResult, DetectorError> {
        Scrublet::scrub_doublets(self)
    }

    fn call_doublets(&mut self, threshold: Option<f32>) -> Result<ScrubletResult, DetectorError> {
        Scrublet::call_doublets(self, threshold)
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    /// Three cell types with their own marker genes plus planted heterotypic
    /// doublets (sum of a type 0 and a type 1 cell) at the end.
    pub(crate) fn clustered_with_doublets(n_per_type: usize, n_doublets: usize) -> ExpressionMatrix {
        let n_markers = 10;
        let n_genes = 3 * n_markers;
        let singlet = |cell_type: usize, i: usize| -> Vec<f32> {
            (0..n_genes)
                .map(|g| {
                    if g / n_markers == cell_type {
                        (20 + (i * 7 + g * 3) % 11) as f32
                    } else {
                        ((i + g) % 3 == 0) as u8 as f32
                    }
                })
                .collect()
        };

        let mut rows = Vec::new();
        for cell_type in 0..3 {
            for i in 0..n_per_type {
                rows.push(singlet(cell_type, i));
            }
        }
        for d in 0..n_doublets {
            let a = singlet(0, d + 100);
            let b = singlet(1, d + 200);
            rows.push(a.iter().zip(b.iter()).map(|(x, y)| x + y).collect());
        }
        ExpressionMatrix::from_rows(&rows).unwrap()
    }

    fn mean(x: &[f32]) -> f32 {
        x.iter().sum::<f32>() / x.len() as f32
    }

    #[test]
    fn test_scores_aligned_to_cells() {
        let matrix = clustered_with_doublets(20, 4);
        let mut scrublet =
            Scrublet::new(&matrix, ScrubletParams::default(), ScrubParams::default()).unwrap();
        let res = scrublet.scrub_doublets().unwrap();

        assert_eq!(res.predicted_doublets.len(), 64);
        assert_eq!(res.doublet_scores_obs.len(), 64);
        assert_eq!(res.z_scores.len(), 64);
        assert_eq!(res.doublet_scores_sim.len(), 128);
        assert!(res.doublet_scores_obs.iter().all(|&s| s >= 0.0));
    }

    #[test]
    fn test_planted_doublets_score_higher() {
        let matrix = clustered_with_doublets(30, 6);
        let scrub_params = ScrubParams {
            min_gene_var_pctl: 0.0,
            no_pcs: 10,
            ..Default::default()
        };
        let mut scrublet =
            Scrublet::new(&matrix, ScrubletParams::default(), scrub_params).unwrap();
        let res = scrublet.scrub_doublets().unwrap();

        let singlets = mean(&res.doublet_scores_obs[..90]);
        let doublets = mean(&res.doublet_scores_obs[90..]);
        assert!(
            doublets > singlets,
            "doublets {} vs singlets {}",
            doublets,
            singlets
        );
    }

    #[test]
    fn test_deterministic_with_seed() {
        let matrix = clustered_with_doublets(15, 3);
        let params = ScrubletParams {
            seed: 11,
            ..Default::default()
        };
        let mut a = Scrublet::new(&matrix, params.clone(), ScrubParams::default()).unwrap();
        let mut b = Scrublet::new(&matrix, params, ScrubParams::default()).unwrap();
        assert_eq!(a.scrub_doublets().unwrap(), b.scrub_doublets().unwrap());
    }

    #[test]
    fn test_call_doublets_manual_threshold() {
        let matrix = clustered_with_doublets(15, 3);
        let mut scrublet =
            Scrublet::new(&matrix, ScrubletParams::default(), ScrubParams::default()).unwrap();

        // no scores yet, the scoring path runs implicitly
        let all = scrublet.call_doublets(Some(0.0)).unwrap();
        assert!(all.predicted_doublets.iter().all(|&d| d));
        assert_eq!(all.threshold, 0.0);

        let none = scrublet.call_doublets(Some(f32::INFINITY)).unwrap();
        assert!(none.predicted_doublets.iter().all(|&d| !d));
        assert_eq!(all.doublet_scores_obs, none.doublet_scores_obs);
    }

    #[test]
    fn test_umi_subsampling() {
        let matrix = clustered_with_doublets(15, 3);
        let scrub_params = ScrubParams {
            synthetic_doublet_umi_subsampling: 0.5,
            ..Default::default()
        };
        let mut scrublet =
            Scrublet::new(&matrix, ScrubletParams::default(), scrub_params).unwrap();
        let res = scrublet.scrub_doublets().unwrap();
        assert_eq!(res.predicted_doublets.len(), 48);
    }

    #[test]
    fn test_invalid_params() {
        let matrix = clustered_with_doublets(5, 1);
        let bad_rate = ScrubletParams {
            expected_doublet_rate: 1.5,
            ..Default::default()
        };
        assert!(Scrublet::new(&matrix, bad_rate, ScrubParams::default()).is_err());

        let bad_hvg = ScrubParams {
            hvg_method: "nope".to_string(),
            ..Default::default()
        };
        assert!(Scrublet::new(&matrix, ScrubletParams::default(), bad_hvg).is_err());
    }

    #[test]
    fn test_no_genes_left() {
        let matrix = ExpressionMatrix::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let mut scrublet =
            Scrublet::new(&matrix, ScrubletParams::default(), ScrubParams::default()).unwrap();
        assert!(matches!(
            scrublet.scrub_doublets(),
            Err(DetectorError::NoGenes { .. })
        ));
    }

    #[test]
    fn test_threshold_between_modes() {
        let mut scores: Vec<f32> = (0..200).map(|i| 0.05 + (i % 10) as f32 * 0.005).collect();
        scores.extend((0..100).map(|i| 0.6 + (i % 10) as f32 * 0.01));
        let t = find_threshold_min(&scores, 50);
        assert!(t > 0.1 && t < 0.6, "threshold {}", t);
    }

    #[test]
    fn test_threshold_constant_scores() {
        assert_eq!(find_threshold_min(&[0.3, 0.3, 0.3], 10), 0.3);
    }
}
