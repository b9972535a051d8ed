//! Error types for executors.

use thiserror::Error;

/// Result type alias for executor operations.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Errors surfaced by executors and submit handles.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The executor has been closed; no further work is accepted
    #[error("Executor closed")]
    Closed,

    /// The submitted handler reported a failure
    #[error("Handler failed: {0}")]
    HandlerFailed(String),
}
