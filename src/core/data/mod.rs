//! Module containing anything and everything related to data and data
//! structures

pub mod dense_io;
pub mod expression_matrix;
