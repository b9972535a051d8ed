//! Error types for envelope encoding and validation.

use thiserror::Error;

/// Result type alias for envelope operations.
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// Errors that can occur while building or encoding an envelope.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Encoded envelope exceeds the configured size limit
    #[error("Envelope size {size} bytes exceeds limit of {limit} bytes")]
    SizeExceeded { size: usize, limit: usize },
}
