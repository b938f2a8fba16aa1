//! Core type definitions for twinsync.
//!
//! This crate defines the vocabulary shared by every stage of a sync cycle:
//! - Replica sides and per-replica node identifiers
//! - Internal (store-local) node ids
//! - Canonically normalized item names
//! - Node, operation and conflict kinds
//!
//! Nothing here performs I/O.

mod ids;
mod kinds;
mod name;
mod side;

pub use ids::{DbNodeId, NodeId};
pub use kinds::{ConflictType, NodeType, OperationType};
pub use name::{is_normalized, normalize, SyncName};
pub use side::ReplicaSide;

/// Seconds since the Unix epoch, as reported by a replica.
pub type SyncTime = i64;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("name is not in canonical form: {0:?}")]
    NotNormalized(String),

    #[error("invalid node type: {0}")]
    InvalidNodeType(String),

    #[error("invalid replica side: {0}")]
    InvalidSide(String),
}
