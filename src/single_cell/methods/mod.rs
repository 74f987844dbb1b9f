//! Specific named methods in the single cell space are implemented here.
//! Currently the two doublet detection methods.

pub mod doublet_detection;
pub mod scrublet;
