//! Minimal dense network building blocks on top of `faer` matrices with
//! hand-written backward passes and an Adam optimiser.

pub mod linear;
pub mod optimiser;
