//! Doublet calling for single cell count matrices.
//!
//! Two detectors run on the same matrix: a Scrublet style detector that
//! scores cells by the density of simulated doublets in their neighbourhood,
//! and a Boost style classifier that clusters observed and simulated cells
//! over many iterations. Their calls are merged with a [`CombinePolicy`].

pub mod core;
pub mod error;
pub mod single_cell;
pub mod utils;

pub use crate::core::data::dense_io::{read_expression_csv, CsvReadParams};
pub use crate::core::data::expression_matrix::ExpressionMatrix;
pub use crate::error::{ConfigError, DetectorError, DoubletError, InputError, Result};
pub use crate::single_cell::doublet_caller::{
    combine_calls, detect_doublets, detect_doublets_with_params, run_doublet_callers,
    BoostCalls, CombinePolicy, CombinedResult, DoubletCallerParams, ScrubletCalls,
};
pub use crate::single_cell::methods::doublet_detection::{BoostClassifier, BoostParams, BoostResult};
pub use crate::single_cell::methods::scrublet::{
    ScrubParams, Scrublet, ScrubletParams, ScrubletResult,
};
pub use crate::utils::traits::{DensityDoubletDetector, EnsembleDoubletDetector};
