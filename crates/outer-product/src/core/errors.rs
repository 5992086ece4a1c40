//! Error types emitted by the outer-product aggregator.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OuterProductError>;

/// Aggregator-specific error category.
///
/// Every variant is a local precondition violation or a backend failure; the
/// computation is deterministic, so nothing here is worth retrying.
#[derive(Debug, Error)]
pub enum OuterProductError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },

    /// Chunk sizes must lie in `[1, hidden_dim]`.
    #[error("invalid chunk size {chunk_size}: must be in [1, {hidden_dim}]")]
    InvalidChunkSize { chunk_size: usize, hidden_dim: usize },

    /// Construction-time configuration failures.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The layer does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },

    /// A tensor backend failure propagated to the caller.
    #[error("backend error: {0}")]
    Backend(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("serde_json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OuterProductError {
    pub(crate) fn shape<S: Into<String>>(context: S) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }
}
