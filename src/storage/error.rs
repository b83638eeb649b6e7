//! Storage-specific error types.
//!
//! All storage operations return [`StorageError`] on failure, which can be
//! matched to determine the underlying cause (database, channel, capacity, etc.).

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database operation failed (sqlx error).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Every buffered entry is in flight, nothing can be evicted.
    #[error("storage full: all {capacity} entries are in flight")]
    StorageFull { capacity: usize },

    /// Failed to send command to the buffer actor.
    #[error("failed to send command to buffer actor")]
    ChannelSend,

    /// The buffer actor dropped the reply channel (actor stopped).
    #[error("buffer actor stopped before replying")]
    ActorGone,

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error (backup export).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (e.g., task join failure).
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid data in database (e.g., unknown enum value).
    #[error("invalid data: {0}")]
    InvalidData(String),
}
