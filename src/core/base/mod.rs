//! Module containing key statistic functions: PCA, loess and the
//! hypergeometric test.

pub mod loess;
pub mod pca_svd;
pub mod stats;
