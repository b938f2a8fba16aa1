//! Node, operation and conflict kinds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of item on a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Directory,
}

impl NodeType {
    /// Stable textual form, used as the persisted column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "dir",
        }
    }

    #[must_use]
    pub const fn is_dir(self) -> bool {
        matches!(self, Self::Directory)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "dir" => Ok(Self::Directory),
            other => Err(crate::Error::InvalidNodeType(other.to_string())),
        }
    }
}

/// Kind of change carried by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Create,
    Delete,
    Move,
    Edit,
    /// Metadata-only change (placeholder attributes, pin state).
    UpdateMetadata,
    /// Detected but deliberately not propagated.
    Ignore,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Classification of a pair of incompatible changes.
///
/// The declaration order is the resolution priority: when several conflicts
/// overlap in one cycle, the one with the smaller variant is handled first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConflictType {
    EditDelete,
    MoveDelete,
    MoveParentDelete,
    CreateParentDelete,
    MoveMoveSource,
    MoveMoveDest,
    MoveCreate,
    CreateCreate,
    EditEdit,
    MoveMoveCycle,
}

impl ConflictType {
    /// All conflict types in priority order.
    pub const ALL: [ConflictType; 10] = [
        Self::EditDelete,
        Self::MoveDelete,
        Self::MoveParentDelete,
        Self::CreateParentDelete,
        Self::MoveMoveSource,
        Self::MoveMoveDest,
        Self::MoveCreate,
        Self::CreateCreate,
        Self::EditEdit,
        Self::MoveMoveCycle,
    ];

    /// Conflicts where a Delete on one side wins over a change on the other.
    #[must_use]
    pub const fn is_delete_family(self) -> bool {
        matches!(
            self,
            Self::EditDelete | Self::MoveDelete | Self::MoveParentDelete | Self::CreateParentDelete
        )
    }

    /// Conflicts where two items compete for one destination name.
    #[must_use]
    pub const fn is_name_clash(self) -> bool {
        matches!(self, Self::MoveMoveDest | Self::MoveCreate | Self::CreateCreate)
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
