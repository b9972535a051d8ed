//! Error types for transports.

use thiserror::Error;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced by transport implementations.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The transport is not ready to publish
    #[error("Transport not ready: {0}")]
    NotReady(String),

    /// Publishing to the destination failed
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Creating a subscription failed
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Serialization error on the wire boundary
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
