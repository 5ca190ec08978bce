//! Error type for the alignment engine.
//!
//! Configuration problems are raised at construction time, before any
//! training happens. Numerical problems halt the current training pass after
//! the last finite parameters were restored. Data mismatches inside the
//! alignment loss are not errors; they are collected as warnings.

use thiserror::Error;

/// Crate wide result alias
pub type AlignResult<T> = Result<T, AlignError>;

/// All failure conditions of the alignment engine
#[derive(Debug, Error)]
pub enum AlignError {
    /// Generic invalid parameter
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// A model was built with a different latent width than the run declares
    #[error("Latent width mismatch for {component}: expected {expected}, got {got}")]
    LatentWidthMismatch {
        component: String,
        expected: usize,
        got: usize,
    },

    /// A label column that was asked for is not present
    #[error("Label key '{key}' not found in species '{species}'")]
    MissingLabelKey { species: String, key: String },

    /// The homology correspondence has no usable gene pairs
    #[error("Homology correspondence between '{context}' and '{target}' is empty")]
    EmptyHomology { context: String, target: String },

    /// Inputs disagree in their sizes or indices
    #[error("Data mismatch: {message}")]
    DataMismatch { message: String },

    /// Parameter import between incompatible shapes
    #[error("Shape mismatch for '{name}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: (usize, usize),
        got: (usize, usize),
    },

    /// Loss turned NaN/Inf during training
    #[error(
        "Non-finite loss in epoch {epoch}, batch {batch}; parameters restored to epoch {last_finite_epoch:?}"
    )]
    NonFiniteLoss {
        epoch: usize,
        batch: usize,
        last_finite_epoch: Option<usize>,
    },

    /// No stored parameters under that tag/component
    #[error("No checkpoint '{component}' stored under tag '{tag}'")]
    CheckpointNotFound { tag: String, component: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl AlignError {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        AlignError::Config {
            message: message.into(),
        }
    }

    /// Shorthand for a data mismatch
    pub fn data(message: impl Into<String>) -> Self {
        AlignError::DataMismatch {
            message: message.into(),
        }
    }
}
