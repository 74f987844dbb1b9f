//! Contains the single cell functionalities. There are dependencies on
//! other parts of the package, specifically around the generation of kNN
//! graphs, PCA and community detection.

pub mod doublet_caller;
pub mod methods;
pub mod processing;
