use crate::core::data::expression_matrix::ExpressionMatrix;
use crate::error::DetectorError;
use crate::single_cell::methods::doublet_detection::BoostResult;
use crate::single_cell::methods::scrublet::ScrubletResult;

/// Detector that scores cells by the density of simulated doublets in their
/// neighbourhood
///
/// Bound to one expression matrix at construction.
pub trait DensityDoubletDetector: Send {
    /// Default path with an automatically determined threshold
    fn scrub_doublets(&mut self) -> Result<ScrubletResult, DetectorError>;

    /// Alternate path with an optional manual threshold
    fn call_doublets(&mut self, threshold: Option<f32>) -> Result<ScrubletResult, DetectorError>;
}

/// Detector that fits an ensemble of iterations and calls doublets by voting
pub trait EnsembleDoubletDetector: Send {
    fn fit(&mut self, matrix: &ExpressionMatrix) -> Result<(), DetectorError>;

    fn predict(&self, p_thresh: f32, voter_thresh: f32) -> Result<BoostResult, DetectorError>;
}
