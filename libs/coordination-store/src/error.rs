//! Error types for the coordination store.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during coordination store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A referenced row does not exist
    #[error("Row not found: {0}")]
    RowNotFound(Uuid),

    /// Serialization of a batch request or reply failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration journal is in a state the command cannot proceed from
    #[error("Migration journal error: {0}")]
    Journal(String),

    /// Generic error with context
    #[error("Store error: {0}")]
    Other(#[from] anyhow::Error),
}
