//! Error types shared by the store and the synchronizer.

use std::time::Duration;
use thiserror::Error;

/// Failures reported by a document store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("network error: {0}")]
    Network(String),

    /// The store refused the operation
    #[error("permission denied at {0}")]
    PermissionDenied(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The value cannot be stored with the requested operation
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking store task panicked or was cancelled
    #[error("store task failed: {0}")]
    Task(String),
}

/// Failures of a synchronized read or write.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No signed-in user for an operation that needs one
    #[error("not signed in")]
    Unauthenticated,

    /// A write for the same user and field has not settled yet
    #[error("{field} update already in progress")]
    InFlight { field: &'static str },

    /// The store rejected the write; the local value was reverted
    #[error("remote write failed: {0}")]
    RemoteWriteFailed(#[source] StoreError),

    /// The store rejected the read; the local value stays at its default
    #[error("remote read failed: {0}")]
    RemoteReadFailed(#[source] StoreError),

    /// Waiting was abandoned; the underlying call may still complete
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}
