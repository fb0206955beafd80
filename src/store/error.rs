//! Storage error types.

use thiserror::Error;

/// Error type for outbox/inbox/job storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Database file or directory could not be prepared
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored id did not parse as a UUID
    #[error("invalid uuid: {0}")]
    Uuid(#[from] uuid::Error),

    /// A stored timestamp did not parse
    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),

    /// A lock guarding in-process storage was poisoned
    #[error("store lock poisoned during {0}")]
    LockPoisoned(&'static str),

    /// Row not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Stored data violates an expected shape
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;
