//! Cross-species latent alignment: per species variational encoder/decoder
//! pairs, a context fit, prototype based alignment of the target species and
//! evaluation via label transfer and log-fold changes.

pub mod checkpoint;
pub mod config;
pub mod context_trainer;
pub mod data_neighbours;
pub mod label_transfer;
pub mod lfc;
pub mod likelihood;
pub mod model;
pub mod prototypes;
pub mod run;
pub mod target_trainer;
pub mod training;
