//! Error types for the node store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Node not found.
    #[error("node not found: {0}")]
    NotFound(String),

    /// A persisted row violates an invariant (e.g. an unnormalized name).
    #[error("corrupted data: {0}")]
    Corrupted(String),

    /// Schema upgrade failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// The file was written by a newer schema than this build knows.
    #[error("unsupported schema version {found} (newest supported is {supported})")]
    UnsupportedVersion { found: i64, supported: i64 },

    /// The caller asked for something the store refuses to do.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// IO error (file system).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A thread panicked while holding a store lock.
    #[error("store lock poisoned")]
    Poisoned,
}
