//! Core numerical building blocks that are independent of the doublet
//! callers: data structures, statistics and graph methods.

pub mod base;
pub mod data;
pub mod graph;
