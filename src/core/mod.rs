//! Core building blocks that are not specific to the alignment model:
//! numerics, dense layers, neighbour searches and data containers.

pub mod base;
pub mod data;
pub mod graph;
pub mod nn;
