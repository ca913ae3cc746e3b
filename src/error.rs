//! Common error types for the tessera backend.
//!
//! Provides unified error handling across all modules.

use thiserror::Error;

/// Root error type for the tessera backend.
#[derive(Debug, Error)]
pub enum TesseraError {
    /// Configuration errors.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Logging errors.
    #[error("logging error: {0}")]
    Logging(#[from] crate::logging::LoggingError),

    /// Coordination/object storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::traits::StorageError),

    /// Submission queue errors (full queue, closed queue).
    #[error("queue error: {0}")]
    Queue(String),

    /// Checkpoint signing or parsing errors.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Witness gateway errors.
    #[error("witness error: {0}")]
    Witness(String),

    /// Malformed tile or path addressing.
    #[error("addressing error: {0}")]
    Addressing(String),

    /// Tree construction is internally inconsistent (should never happen
    /// on a correctly maintained log).
    #[error("tree inconsistency: {0}")]
    Inconsistent(String),

    /// Validation errors surfaced back to callers of the public API.
    #[error("validation error: {0}")]
    Validation(String),

    /// Catch-all internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TesseraError {
    /// Create a queue error.
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    /// Create a checkpoint error.
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a witness error.
    pub fn witness(msg: impl Into<String>) -> Self {
        Self::Witness(msg.into())
    }

    /// Create an addressing error.
    pub fn addressing(msg: impl Into<String>) -> Self {
        Self::Addressing(msg.into())
    }

    /// Create a tree inconsistency error.
    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::Inconsistent(msg.into())
    }

    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a caller may reasonably retry the operation that produced
    /// this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TesseraError::Storage(_) | TesseraError::Witness(_) | TesseraError::Io(_)
        )
    }

    /// Stable error code, useful for metrics and log correlation.
    pub fn error_code(&self) -> &'static str {
        match self {
            TesseraError::Config(_) => "CONFIG_ERROR",
            TesseraError::Logging(_) => "LOGGING_ERROR",
            TesseraError::Storage(_) => "STORAGE_ERROR",
            TesseraError::Queue(_) => "QUEUE_ERROR",
            TesseraError::Checkpoint(_) => "CHECKPOINT_ERROR",
            TesseraError::Witness(_) => "WITNESS_ERROR",
            TesseraError::Addressing(_) => "ADDRESSING_ERROR",
            TesseraError::Inconsistent(_) => "TREE_INCONSISTENCY",
            TesseraError::Validation(_) => "VALIDATION_ERROR",
            TesseraError::Internal(_) => "INTERNAL_ERROR",
            TesseraError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias using [`TesseraError`].
pub type Result<T> = std::result::Result<T, TesseraError>;
