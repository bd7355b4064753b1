use std::error::Error as StdError;

use thiserror::Error;

/// Lattice's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Lattice's crate-wide error type.
///
/// This is intentionally decoupled from `anyhow` so downstream libraries aren't forced to
/// adopt `anyhow` in their own public APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller misconfigured a loss or decoder instance: mismatched alphabet
    /// size, zero beam width, an out-of-range blank index, or a malformed batch
    /// shape. Surfaced before any computation begins.
    #[error("configuration: {0}")]
    Configuration(String),

    /// The target sequence cannot be aligned to the available frames. Each
    /// adjacent repeated label needs one separating blank frame, so the minimum
    /// is `target length + adjacent repeats`.
    #[error("infeasible alignment: target needs at least {required} frames, sequence has {available}")]
    InfeasibleAlignment { required: usize, available: usize },

    /// An emission entry was NaN or +inf. Negative infinity is a legal
    /// log-probability (zero probability) and is not rejected.
    #[error("non-finite emission at timestep {timestep}, symbol {symbol}")]
    NonFiniteEmission { timestep: usize, symbol: usize },

    /// Every alignment of the target has zero probability under the provided
    /// emissions, so neither the loss nor the gradient is defined.
    #[error("alignment has zero probability under the provided emissions")]
    ZeroProbabilityAlignment,

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

impl Error {
    pub(crate) fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Message(format!("{err:#}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(Box::new(err))
    }
}
