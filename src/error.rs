//! Error types for reading expression data, validating parameters and
//! running the doublet detectors.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used by the public entry points
pub type Result<T> = std::result::Result<T, DoubletError>;

/// Problems with the input file. Every variant carries the path so that the
/// caller can tell which file was rejected.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("Could not read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed delimited file {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Input file {path:?} is empty: {details}")]
    Empty { path: PathBuf, details: String },

    #[error("Header mismatch in {path:?} on line {line}: expected {expected} fields, found {found}")]
    HeaderMismatch {
        path: PathBuf,
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("Could not parse value {value:?} in {path:?} (line {line}, column {column})")]
    Parse {
        path: PathBuf,
        line: u64,
        column: usize,
        value: String,
    },

    #[error("Negative expression value in {path:?} (line {line}, column {column})")]
    NegativeValue {
        path: PathBuf,
        line: u64,
        column: usize,
    },

    #[error("Duplicated {kind} identifier {label:?} in {path:?}")]
    DuplicateLabel {
        path: PathBuf,
        kind: &'static str,
        label: String,
    },

    #[error("Invalid expression matrix: {0}")]
    Shape(String),
}

/// A parameter outside of its valid range
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Parameter `{name}` = {value} is outside of its valid range {range}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        range: &'static str,
    },

    #[error("Invalid value {value:?} for `{name}`")]
    InvalidOption { name: &'static str, value: String },

    #[error("Could not parse parameters: {0}")]
    Parse(String),
}

/// Failures raised inside one of the detection methods
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Not enough cells: {found} available, {required} required")]
    InsufficientCells { found: usize, required: usize },

    #[error("No genes left after filtering (min_cells = {min_cells})")]
    NoGenes { min_cells: usize },

    #[error("SVD did not converge: {0}")]
    Svd(String),

    #[error("The classifier needs to be fitted before predicting")]
    NotFitted,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Top level error of the doublet caller
#[derive(Error, Debug)]
pub enum DoubletError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Doublet detector `{detector}` failed: {source}")]
    Detector {
        detector: &'static str,
        #[source]
        source: DetectorError,
    },

    #[error("Combination of per-cell calls failed: {0}")]
    Combine(String),
}

/// Check that a value lies in the open unit interval
pub fn check_open_unit(name: &'static str, value: f64) -> std::result::Result<(), ConfigError> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value,
            range: "(0, 1)",
        })
    }
}
