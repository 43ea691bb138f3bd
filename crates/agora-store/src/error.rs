//! Error types for the store module.

use thiserror::Error;

/// Errors raised by the persistence backends.
///
/// Validation rejections in the replicated store are not errors; they are
/// reported through [`crate::AddResult`] and friends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// CBOR encoding or decoding of a stored value failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stored row could not be interpreted.
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("migration error: {0}")]
    Migration(String),

    /// The blocking worker for a database call panicked or was cancelled.
    #[error("background task failed: {0}")]
    Background(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
