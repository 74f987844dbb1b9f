//! Doublet caller that runs both detectors on one expression matrix and
//! merges their per-cell calls with an explicit combination policy.

use log::info;
use serde::Deserialize;
use std::path::Path;
use std::time::Instant;

use crate::core::data::dense_io::{read_expression_csv, CsvReadParams};
use crate::core::data::expression_matrix::ExpressionMatrix;
use crate::error::{check_open_unit, ConfigError, DetectorError, DoubletError, InputError, Result};
use crate::single_cell::methods::doublet_detection::{BoostClassifier, BoostParams, BoostResult};
use crate::single_cell::methods::scrublet::{ScrubParams, Scrublet, ScrubletParams, ScrubletResult};
use crate::utils::traits::{DensityDoubletDetector, EnsembleDoubletDetector};

///////////
// Types //
///////////

/// Per-cell calls of the density based detector
pub type ScrubletCalls = ScrubletResult;

/// Per-cell calls of the ensemble detector
pub type BoostCalls = BoostResult;

/// How two per-cell boolean calls are merged into one decision
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CombinePolicy {
    /// A cell is a doublet if either detector flags it
    #[default]
    Union,
    /// A cell is a doublet only if both detectors flag it
    Intersection,
}

/// Combined result of both detectors
///
/// ### Fields
///
/// * `cell_ids` - The cell identifiers in input row order.
/// * `scrublet` - Full result of the density based detector.
/// * `boost` - Full result of the ensemble detector.
/// * `policy` - The policy used for `doublets`.
/// * `doublets` - Merged per-cell decision.
#[derive(Clone, Debug, PartialEq)]
pub struct CombinedResult {
    pub cell_ids: Vec<String>,
    pub scrublet: ScrubletCalls,
    pub boost: BoostCalls,
    pub policy: CombinePolicy,
    pub doublets: Vec<bool>,
}

impl CombinedResult {
    /// Number of cells
    pub fn len(&self) -> usize {
        self.doublets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doublets.is_empty()
    }

    /// Row indices of the cells flagged by the merged decision
    pub fn doublet_indices(&self) -> Vec<usize> {
        self.doublets
            .iter()
            .enumerate()
            .filter_map(|(i, &d)| d.then_some(i))
            .collect()
    }

    /// Identifiers of the cells flagged by the merged decision
    pub fn doublet_ids(&self) -> Vec<&str> {
        self.doublet_indices()
            .into_iter()
            .map(|i| self.cell_ids[i].as_str())
            .collect()
    }
}

////////////
// Params //
////////////

/// Parameters of the doublet caller
///
/// ### Fields
///
/// * `scrublet` - Construction parameters of the density based detector.
///   `expected_doublet_rate` is the prior doublet rate.
/// * `scrub` - Scoring path parameters of the density based detector.
/// * `call_override` - If set, the alternate call path of the density based
///   detector is used with this threshold.
/// * `boost` - Parameters of the ensemble detector.
/// * `p_thresh` - P-value threshold of the ensemble vote.
/// * `voter_thresh` - Voting threshold of the ensemble vote.
/// * `policy` - The `CombinePolicy`.
/// * `parallel` - Run both detectors concurrently.
/// * `seed` - If set, overrides the seeds of both detectors.
/// * `csv` - Reader parameters.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DoubletCallerParams {
    pub scrublet: ScrubletParams,
    pub scrub: ScrubParams,
    pub call_override: Option<f32>,
    pub boost: BoostParams,
    pub p_thresh: f32,
    pub voter_thresh: f32,
    pub policy: CombinePolicy,
    pub parallel: bool,
    pub seed: Option<u64>,
    pub csv: CsvReadParams,
}

impl Default for DoubletCallerParams {
    fn default() -> Self {
        Self {
            scrublet: ScrubletParams::default(),
            scrub: ScrubParams {
                min_counts: 2.0,
                min_cells: 3,
                min_gene_var_pctl: 85.0,
                no_pcs: 30,
                ..ScrubParams::default()
            },
            call_override: None,
            boost: BoostParams {
                n_iters: 50,
                use_clustering_ensemble: false,
                standard_scaling: true,
                ..BoostParams::default()
            },
            p_thresh: 1e-16,
            voter_thresh: 0.5,
            policy: CombinePolicy::Union,
            parallel: true,
            seed: None,
            csv: CsvReadParams::default(),
        }
    }
}

impl DoubletCallerParams {
    /// Parse parameters from a JSON document
    ///
    /// Missing top level fields take the caller defaults. A nested section
    /// that is present falls back to the defaults of its own structure for
    /// missing fields.
    pub fn from_json_str(json: &str) -> std::result::Result<Self, ConfigError> {
        let params: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// Read parameters from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| InputError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_json_str(&json)?)
    }

    /// Check all parameters
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        // checked under the caller's name first, the Scrublet check below
        // repeats it as `expected_doublet_rate`
        check_open_unit("expected_rate", self.scrublet.expected_doublet_rate as f64)?;
        self.scrublet.validate()?;
        self.scrub.validate()?;
        self.boost.validate()?;
        check_open_unit("p_thresh", self.p_thresh as f64)?;
        if !(0.0..=1.0).contains(&self.voter_thresh) {
            return Err(ConfigError::OutOfRange {
                name: "voter_thresh",
                value: self.voter_thresh as f64,
                range: "[0, 1]",
            });
        }
        if let Some(t) = self.call_override {
            if t.is_nan() {
                return Err(ConfigError::InvalidOption {
                    name: "call_override",
                    value: t.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Density detector parameters with the seed override applied
    fn scrublet_params(&self) -> ScrubletParams {
        let mut params = self.scrublet.clone();
        if let Some(seed) = self.seed {
            params.seed = seed;
        }
        params
    }

    /// Ensemble detector parameters with the seed override applied
    fn boost_params(&self) -> BoostParams {
        let mut params = self.boost.clone();
        if let Some(seed) = self.seed {
            params.seed = seed;
        }
        params
    }
}

/////////////
// Combine //
/////////////

/// Combine two per-cell boolean calls into one decision
///
/// ### Params
///
/// * `a` - Calls of the first detector.
/// * `b` - Calls of the second detector.
/// * `policy` - The `CombinePolicy`.
///
/// ### Returns
///
/// The merged calls or `DoubletError::Combine` if the lengths differ.
pub fn combine_calls(a: &[bool], b: &[bool], policy: CombinePolicy) -> Result<Vec<bool>> {
    if a.len() != b.len() {
        return Err(DoubletError::Combine(format!(
            "calls of length {} and {} cannot be combined",
            a.len(),
            b.len()
        )));
    }

    Ok(a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| match policy {
            CombinePolicy::Union => x || y,
            CombinePolicy::Intersection => x && y,
        })
        .collect())
}

//////////
// Main //
//////////

/// Wrap a failure of one detector
fn detector_err(detector: &'static str) -> impl Fn(DetectorError) -> DoubletError {
    move |source| DoubletError::Detector { detector, source }
}

fn run_density<S: DensityDoubletDetector>(
    scrublet: &mut S,
    call_override: Option<f32>,
) -> Result<ScrubletCalls> {
    let start = Instant::now();
    let res = match call_override {
        Some(threshold) => scrublet.call_doublets(Some(threshold)),
        None => scrublet.scrub_doublets(),
    }
    .map_err(detector_err("scrublet"))?;
    info!("Density detector finished in {:.2?}", start.elapsed());
    Ok(res)
}

fn run_ensemble<B: EnsembleDoubletDetector>(
    boost: &mut B,
    matrix: &ExpressionMatrix,
    p_thresh: f32,
    voter_thresh: f32,
) -> Result<BoostCalls> {
    let start = Instant::now();
    boost.fit(matrix).map_err(detector_err("boost"))?;
    let res = boost
        .predict(p_thresh, voter_thresh)
        .map_err(detector_err("boost"))?;
    info!("Ensemble detector finished in {:.2?}", start.elapsed());
    Ok(res)
}

/// Run both detectors on the same matrix and merge their calls
///
/// ### Params
///
/// * `matrix` - The expression matrix both detectors work on.
/// * `scrublet` - The density based detector, bound to `matrix`.
/// * `boost` - The ensemble detector, fitted on `matrix` here.
/// * `params` - The `DoubletCallerParams`.
///
/// ### Returns
///
/// The `CombinedResult`, or the first detector failure.
pub fn run_doublet_callers<S, B>(
    matrix: &ExpressionMatrix,
    scrublet: &mut S,
    boost: &mut B,
    params: &DoubletCallerParams,
) -> Result<CombinedResult>
where
    S: DensityDoubletDetector,
    B: EnsembleDoubletDetector,
{
    let (scrublet_res, boost_res) = if params.parallel {
        rayon::join(
            || run_density(scrublet, params.call_override),
            || run_ensemble(boost, matrix, params.p_thresh, params.voter_thresh),
        )
    } else {
        (
            run_density(scrublet, params.call_override),
            run_ensemble(boost, matrix, params.p_thresh, params.voter_thresh),
        )
    };
    let scrublet_res = scrublet_res?;
    let boost_res = boost_res?;

    let n_cells = matrix.n_cells();
    for (name, len) in [
        ("scrublet", scrublet_res.predicted_doublets.len()),
        ("boost", boost_res.predicted_doublets.len()),
    ] {
        if len != n_cells {
            return Err(DoubletError::Combine(format!(
                "{} returned {} calls for {} cells",
                name, len, n_cells
            )));
        }
    }

    let doublets = combine_calls(
        &scrublet_res.predicted_doublets,
        &boost_res.predicted_doublets,
        params.policy,
    )?;

    Ok(CombinedResult {
        cell_ids: matrix.cell_ids().to_vec(),
        scrublet: scrublet_res,
        boost: boost_res,
        policy: params.policy,
        doublets,
    })
}

/// Detect doublets in the expression matrix stored at `path`
///
/// Parameters are validated before the file is touched and the file is read
/// completely before any detector is constructed.
///
/// ### Params
///
/// * `path` - Delimited text file, cells in rows and genes in columns.
/// * `params` - The `DoubletCallerParams`.
///
/// ### Returns
///
/// The `CombinedResult`
pub fn detect_doublets_with_params(
    path: impl AsRef<Path>,
    params: &DoubletCallerParams,
) -> Result<CombinedResult> {
    let start_all = Instant::now();
    params.validate()?;

    let matrix = read_expression_csv(path.as_ref(), &params.csv)?;

    let mut scrublet = Scrublet::new(&matrix, params.scrublet_params(), params.scrub.clone())?;
    let mut boost = BoostClassifier::new(params.boost_params())?;

    let res = run_doublet_callers(&matrix, &mut scrublet, &mut boost, params)?;

    info!(
        "Flagged {} of {} cells as doublets ({:?}) in {:.2?}",
        res.doublet_indices().len(),
        res.len(),
        res.policy,
        start_all.elapsed()
    );

    Ok(res)
}

/// Detect doublets with the default caller configuration
///
/// ### Params
///
/// * `path` - Delimited text file, cells in rows and genes in columns.
/// * `expected_rate` - Prior doublet rate in `(0, 1)`, usually `0.1`.
/// * `call_override` - Manual threshold for the density based detector. If
///   set, its alternate call path is used.
pub fn detect_doublets(
    path: impl AsRef<Path>,
    expected_rate: f32,
    call_override: Option<f32>,
) -> Result<CombinedResult> {
    let mut params = DoubletCallerParams::default();
    params.scrublet.expected_doublet_rate = expected_rate;
    params.call_override = call_override;
    detect_doublets_with_params(path, &params)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_tmp(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    /// 5 cells x 3 genes, `c4` duplicates `c0`
    const DUPLICATED_ROW_CSV: &str = "\
cell,g0,g1,g2
c0,5,2,3
c1,2,6,2
c2,3,3,7
c3,6,4,2
c4,5,2,3
";

    fn fixed_scrublet_result(calls: Vec<bool>) -> ScrubletResult {
        let n = calls.len();
        ScrubletResult {
            predicted_doublets: calls,
            doublet_scores_obs: vec![0.1; n],
            doublet_scores_sim: vec![0.5; 2 * n],
            doublet_errors_obs: vec![0.01; n],
            z_scores: vec![0.0; n],
            threshold: 0.3,
            detected_doublet_rate: 0.0,
            detectable_doublet_fraction: 0.0,
            overall_doublet_rate: 0.0,
        }
    }

    #[derive(Default)]
    struct MockDensity {
        calls: Vec<bool>,
        scrub_count: usize,
        call_count: usize,
        last_threshold: Option<f32>,
        fail: bool,
    }

    impl DensityDoubletDetector for MockDensity {
        fn scrub_doublets(&mut self) -> std::result::Result<ScrubletResult, DetectorError> {
            self.scrub_count += 1;
            if self.fail {
                return Err(DetectorError::NoGenes { min_cells: 3 });
            }
            Ok(fixed_scrublet_result(self.calls.clone()))
        }

        fn call_doublets(
            &mut self,
            threshold: Option<f32>,
        ) -> std::result::Result<ScrubletResult, DetectorError> {
            self.call_count += 1;
            self.last_threshold = threshold;
            if self.fail {
                return Err(DetectorError::NoGenes { min_cells: 3 });
            }
            Ok(fixed_scrublet_result(self.calls.clone()))
        }
    }

    #[derive(Default)]
    struct MockEnsemble {
        calls: Vec<bool>,
        fit_count: usize,
        fail: bool,
    }

    impl EnsembleDoubletDetector for MockEnsemble {
        fn fit(&mut self, _matrix: &ExpressionMatrix) -> std::result::Result<(), DetectorError> {
            self.fit_count += 1;
            if self.fail {
                return Err(DetectorError::InsufficientCells {
                    found: 0,
                    required: 2,
                });
            }
            Ok(())
        }

        fn predict(
            &self,
            _p_thresh: f32,
            _voter_thresh: f32,
        ) -> std::result::Result<BoostResult, DetectorError> {
            if self.fit_count == 0 {
                return Err(DetectorError::NotFitted);
            }
            let n = self.calls.len();
            Ok(BoostResult {
                predicted_doublets: self.calls.clone(),
                doublet_scores: vec![0.0; n],
                voting_average: vec![0.0; n],
            })
        }
    }

    fn four_cells() -> ExpressionMatrix {
        ExpressionMatrix::from_rows(&[vec![1.0], vec![2.0], vec![3.0], vec![4.0]]).unwrap()
    }

    fn mocks() -> (MockDensity, MockEnsemble) {
        (
            MockDensity {
                calls: vec![true, false, false, true],
                ..Default::default()
            },
            MockEnsemble {
                calls: vec![true, true, false, false],
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_combine_calls() {
        let a = [true, false, true, false];
        let b = [true, true, false, false];
        assert_eq!(
            combine_calls(&a, &b, CombinePolicy::Union).unwrap(),
            vec![true, true, true, false]
        );
        assert_eq!(
            combine_calls(&a, &b, CombinePolicy::Intersection).unwrap(),
            vec![true, false, false, false]
        );
        assert!(matches!(
            combine_calls(&a, &b[..2], CombinePolicy::Union),
            Err(DoubletError::Combine(_))
        ));
    }

    #[test]
    fn test_default_path_uses_scrub_doublets() {
        let matrix = four_cells();
        let (mut density, mut ensemble) = mocks();
        let res = run_doublet_callers(
            &matrix,
            &mut density,
            &mut ensemble,
            &DoubletCallerParams::default(),
        )
        .unwrap();

        assert_eq!(density.scrub_count, 1);
        assert_eq!(density.call_count, 0);
        assert_eq!(ensemble.fit_count, 1);
        assert_eq!(res.doublets, vec![true, true, false, true]);
        assert_eq!(res.doublet_indices(), vec![0, 1, 3]);
        assert_eq!(res.doublet_ids(), vec!["cell_0", "cell_1", "cell_3"]);
        assert_eq!(res.scrublet.predicted_doublets.len(), 4);
        assert_eq!(res.boost.predicted_doublets.len(), 4);
    }

    #[test]
    fn test_call_override_uses_call_doublets_once() {
        let matrix = four_cells();
        let (mut density, mut ensemble) = mocks();
        let params = DoubletCallerParams {
            call_override: Some(0.25),
            policy: CombinePolicy::Intersection,
            ..Default::default()
        };
        let res = run_doublet_callers(&matrix, &mut density, &mut ensemble, &params).unwrap();

        assert_eq!(density.call_count, 1);
        assert_eq!(density.scrub_count, 0);
        assert_eq!(density.last_threshold, Some(0.25));
        assert_eq!(res.doublets, vec![true, false, false, false]);
        assert_eq!(res.policy, CombinePolicy::Intersection);
    }

    #[test]
    fn test_sequential_matches_parallel() {
        let matrix = four_cells();
        let (mut d1, mut e1) = mocks();
        let (mut d2, mut e2) = mocks();
        let parallel = run_doublet_callers(
            &matrix,
            &mut d1,
            &mut e1,
            &DoubletCallerParams::default(),
        )
        .unwrap();
        let sequential = run_doublet_callers(
            &matrix,
            &mut d2,
            &mut e2,
            &DoubletCallerParams {
                parallel: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(parallel, sequential);
    }

    #[test]
    fn test_detector_failure_is_wrapped() {
        let matrix = four_cells();
        let (mut density, mut ensemble) = mocks();
        ensemble.fail = true;
        let res = run_doublet_callers(
            &matrix,
            &mut density,
            &mut ensemble,
            &DoubletCallerParams::default(),
        );
        assert!(matches!(
            res,
            Err(DoubletError::Detector {
                detector: "boost",
                source: DetectorError::InsufficientCells { .. }
            })
        ));
    }

    #[test]
    fn test_density_failure_is_wrapped() {
        let matrix = four_cells();
        for call_override in [None, Some(0.3)] {
            let (mut density, mut ensemble) = mocks();
            density.fail = true;
            let params = DoubletCallerParams {
                call_override,
                ..Default::default()
            };
            let res = run_doublet_callers(&matrix, &mut density, &mut ensemble, &params);
            assert!(matches!(
                res,
                Err(DoubletError::Detector {
                    detector: "scrublet",
                    source: DetectorError::NoGenes { min_cells: 3 }
                })
            ));
        }
    }

    #[test]
    fn test_misaligned_calls_are_rejected() {
        let matrix = four_cells();
        let (mut density, mut ensemble) = mocks();
        density.calls = vec![true, false];
        let res = run_doublet_callers(
            &matrix,
            &mut density,
            &mut ensemble,
            &DoubletCallerParams::default(),
        );
        assert!(matches!(res, Err(DoubletError::Combine(_))));
    }

    #[test]
    fn test_invalid_rate_before_io() {
        // the path does not exist, so reaching the reader would be an InputError
        for rate in [0.0, 1.0, 1.5, -0.1] {
            let res = detect_doublets("/does/not/exist.csv", rate, None);
            assert!(
                matches!(
                    res,
                    Err(DoubletError::Config(ConfigError::OutOfRange {
                        name: "expected_rate",
                        ..
                    }))
                ),
                "rate {} gave {:?}",
                rate,
                res
            );
        }
    }

    #[test]
    fn test_malformed_input() {
        let empty = write_tmp("");
        assert!(matches!(
            detect_doublets(empty.path(), 0.1, None),
            Err(DoubletError::Input(InputError::Empty { .. }))
        ));

        let mismatch = write_tmp("cell,g0,g1\nc0,1,2\nc1,3\n");
        assert!(matches!(
            detect_doublets(mismatch.path(), 0.1, None),
            Err(DoubletError::Input(InputError::HeaderMismatch { .. }))
        ));

        assert!(matches!(
            detect_doublets("/does/not/exist.csv", 0.1, None),
            Err(DoubletError::Input(InputError::Io { .. }))
        ));
    }

    #[test]
    fn test_duplicated_row_end_to_end() {
        let file = write_tmp(DUPLICATED_ROW_CSV);

        let res = detect_doublets(file.path(), 0.1, None).unwrap();
        assert_eq!(res.len(), 5);
        assert_eq!(res.cell_ids[4], "c4");
        assert!(res.scrublet.predicted_doublets[4] || res.boost.predicted_doublets[4]);
        assert!(res.doublet_indices().contains(&4));
    }

    #[test]
    fn test_zero_call_override_flags_all_cells() {
        let file = write_tmp(DUPLICATED_ROW_CSV);

        // doublet scores are strictly positive and calls use `score > threshold`
        let res = detect_doublets(file.path(), 0.1, Some(0.0)).unwrap();
        assert_eq!(res.scrublet.threshold, 0.0);
        assert!(res.scrublet.doublet_scores_obs.iter().all(|&s| s > 0.0));
        assert!(res.scrublet.predicted_doublets.iter().all(|&d| d));
        assert_eq!(res.doublet_indices(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_default_path_end_to_end() {
        let file = write_tmp(DUPLICATED_ROW_CSV);
        let res = detect_doublets(file.path(), 0.1, None).unwrap();
        assert_eq!(res.scrublet.predicted_doublets.len(), 5);
        assert_eq!(res.boost.predicted_doublets.len(), 5);
        assert_eq!(res.doublets.len(), 5);
    }

    #[test]
    fn test_deterministic_end_to_end() {
        let file = write_tmp(DUPLICATED_ROW_CSV);
        let params = DoubletCallerParams {
            seed: Some(7),
            ..Default::default()
        };
        let a = detect_doublets_with_params(file.path(), &params).unwrap();
        let b = detect_doublets_with_params(file.path(), &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_params_from_json() {
        let params = DoubletCallerParams::from_json_str(
            r#"{"policy": "intersection", "p_thresh": 1e-7, "seed": 3,
                "scrublet": {"expected_doublet_rate": 0.06}}"#,
        )
        .unwrap();
        assert_eq!(params.policy, CombinePolicy::Intersection);
        assert_eq!(params.seed, Some(3));
        assert_eq!(params.scrublet.expected_doublet_rate, 0.06);
        assert_eq!(params.scrublet.sim_doublet_ratio, 2.0);
        assert_eq!(params.scrub.min_counts, 2.0);
        assert_eq!(params.boost.n_iters, 50);

        assert!(matches!(
            DoubletCallerParams::from_json_str(r#"{"voter_thresh": 2.0}"#),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            DoubletCallerParams::from_json_str("not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_params_from_json_file() {
        let file = write_tmp(r#"{"parallel": false}"#);
        let params = DoubletCallerParams::from_json_file(file.path()).unwrap();
        assert!(!params.parallel);
    }
}
