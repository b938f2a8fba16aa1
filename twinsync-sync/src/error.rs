//! Error types for the sync layer.
//!
//! Two levels: [`SyncError`] aborts a whole cycle, [`JobError`] belongs to a
//! single operation and is classified by [`JobError::disposition`] into the
//! fallback the executor applies.

use crate::remote::NetError;
use thiserror::Error;
use twinsync_snapshot::SnapshotError;
use twinsync_store::StoreError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that abort the current sync cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Persisted node store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Snapshot failure.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// The store and the snapshots disagree in a way no fallback covers.
    #[error("inconsistency: {0}")]
    Inconsistency(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error outside any single operation.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation failed in a way that stops the cycle.
    #[error("operation failed fatally: {0}")]
    Fatal(JobError),

    /// The cycle was cancelled by a stop request.
    #[error("cancelled")]
    Cancelled,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

/// How the executor handles a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Blacklist the item temporarily and carry on.
    Blacklist,
    /// The target already reflects the change.
    AlreadyDone,
    /// Try once more later in the cycle.
    Retry,
    /// Look at the target and link it instead of failing.
    Reconcile,
    /// Fail this operation (and its dependents) only.
    OperationFailed,
    /// Stop the cycle.
    Fatal,
}

/// Failure of a single operation's job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The item is locked by another process or user.
    #[error("file locked: {0}")]
    FileLocked(String),

    #[error("not enough space: {0}")]
    NotEnoughSpace(String),

    #[error("path too long: {0}")]
    PathTooLong(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    /// The destination does not accept this kind of item.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A placeholder whose content is not on disk cannot be uploaded.
    #[error("placeholder is not hydrated: {0}")]
    DehydratedPlaceholder(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("API error {code}: {message}")]
    Api { code: String, message: String },

    #[error("rate limited")]
    RateLimited,

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(String),

    /// The store rejected the post-success write.
    #[error("store error: {0}")]
    Store(String),

    #[error("inconsistency: {0}")]
    Inconsistency(String),

    #[error("cancelled")]
    Cancelled,
}

impl JobError {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::AccessDenied(_)
            | Self::Forbidden(_)
            | Self::DehydratedPlaceholder(_)
            | Self::InvalidName(_)
            | Self::PathTooLong(_) => Disposition::Blacklist,
            Self::NotFound(_) => Disposition::AlreadyDone,
            Self::FileLocked(_) => Disposition::Retry,
            Self::AlreadyExists(_) => Disposition::Reconcile,
            Self::QuotaExceeded | Self::NotEnoughSpace(_) | Self::Store(_) => Disposition::Fatal,
            Self::Http { .. }
            | Self::Api { .. }
            | Self::RateLimited
            | Self::Network(_)
            | Self::Io(_)
            | Self::Inconsistency(_)
            | Self::Cancelled => Disposition::OperationFailed,
        }
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let msg = err.to_string();
        match err.kind() {
            ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => Self::AccessDenied(msg),
            ErrorKind::NotFound => Self::NotFound(msg),
            ErrorKind::AlreadyExists | ErrorKind::DirectoryNotEmpty => Self::AlreadyExists(msg),
            ErrorKind::StorageFull => Self::NotEnoughSpace(msg),
            ErrorKind::ResourceBusy => Self::FileLocked(msg),
            _ => Self::Io(msg),
        }
    }
}

impl From<NetError> for JobError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Http { status, message } => match status {
                403 => Self::AccessDenied(message),
                404 => Self::NotFound(message),
                409 => Self::AlreadyExists(message),
                423 => Self::FileLocked(message),
                429 => Self::RateLimited,
                507 => Self::QuotaExceeded,
                _ => Self::Http { status, message },
            },
            NetError::Api { code, message } => match code.as_str() {
                "quota_exceeded" => Self::QuotaExceeded,
                "file_locked" | "lock_error" => Self::FileLocked(message),
                "destination_already_exists" | "conflict_error" => Self::AlreadyExists(message),
                "object_not_found" => Self::NotFound(message),
                "forbidden_error" | "access_denied" => Self::AccessDenied(message),
                "invalid_name" => Self::InvalidName(message),
                _ => Self::Api { code, message },
            },
            NetError::RateLimited => Self::RateLimited,
            NetError::Network(message) => Self::Network(message),
        }
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}
