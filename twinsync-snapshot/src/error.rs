//! Error types for snapshot operations.

use thiserror::Error;
use twinsync_types::NodeId;

/// Result type for snapshot operations.
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Errors raised by snapshot mutations and lookups.
///
/// Structural errors are never swallowed: an observer that feeds an
/// inconsistent item gets the error back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// The item's parent is not present in the snapshot.
    #[error("parent {parent:?} of {id} is not in the snapshot")]
    MissingParent { id: NodeId, parent: Option<NodeId> },

    /// The item's parent is a file.
    #[error("parent {parent} of {id} is not a directory")]
    ParentNotDirectory { id: NodeId, parent: NodeId },

    /// Linking the item under this parent would make it its own ancestor.
    #[error("moving {id} under {parent} would create a cycle")]
    Cycle { id: NodeId, parent: NodeId },

    /// A directory with children cannot turn into a file.
    #[error("{0} still has children and cannot become a file")]
    TypeChangeWithChildren(NodeId),

    /// The root item cannot have a parent.
    #[error("root {0} cannot have a parent")]
    RootWithParent(NodeId),

    /// The root item cannot be removed.
    #[error("the root item cannot be removed")]
    RootRemoval,

    /// No item with this id.
    #[error("item not found: {0}")]
    NotFound(NodeId),

    /// Frozen copies are read-only.
    #[error("snapshot copy is frozen")]
    Frozen,

    /// The path contains a component that cannot exist on this platform.
    #[error("path of {id} has an illegal component {component:?}")]
    IgnoredPath { id: NodeId, component: String },

    /// An arena invariant does not hold.
    #[error("snapshot integrity violated: {0}")]
    Integrity(String),

    /// A thread panicked while holding the snapshot lock.
    #[error("snapshot lock poisoned")]
    Poisoned,
}

impl SnapshotError {
    /// Returns true if the item should be skipped rather than synced.
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::IgnoredPath { .. })
    }
}
