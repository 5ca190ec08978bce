//! Basic numerics shared by the rest of the crate: count likelihoods, KL
//! terms and matrix utilities.

pub mod stats;
pub mod utils;
