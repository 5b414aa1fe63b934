use thiserror::Error;

use crate::{EventId, EventStatus};

/// Errors that can occur when interacting with the retry store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The record's status does not allow the action.
    #[error("Cannot {action} event {id} in {status} status")]
    InvalidTransition {
        id: EventId,
        status: EventStatus,
        action: &'static str,
    },

    #[error("Retryable event not found: {0}")]
    NotFound(EventId),

    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for retry store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
