use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while coordinating across workers.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The lease stayed held by someone else for the whole wait.
    #[error("Timed out after {waited:?} waiting for lock {key}")]
    LockTimeout { key: String, waited: Duration },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for coordination operations.
pub type Result<T> = std::result::Result<T, CoordinationError>;
