//! Error types for convrec-system.

use thiserror::Error;

use crate::stage::Stage;

/// convrec-system error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Model-side error.
    #[error(transparent)]
    Model(#[from] convrec_nn::Error),

    /// Data-side error.
    #[error(transparent)]
    Data(#[from] convrec_core::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Unknown stage tag.
    #[error("invalid stage: {0:?} (expected pretrain, rec or conv)")]
    InvalidStage(String),

    /// Illegal stage transition.
    #[error("cannot run {to} {reason}")]
    StageOrder { to: Stage, reason: &'static str },

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
