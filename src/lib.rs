//! Cross-species alignment of single cell count data in a shared latent
//! space.

pub mod core;
pub mod error;
pub mod single_cell;
pub mod utils;
