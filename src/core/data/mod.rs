//! Species datasets, gene homology maps and synthetic data generation.

pub mod dataset;
pub mod homology;
pub mod synthetic_data;
