//! Operations handed to the executor.

use crate::conflict::Conflict;
use std::fmt;
use std::path::PathBuf;
use twinsync_types::{DbNodeId, NodeId, NodeType, OperationType, ReplicaSide, SyncName};

/// Identifier of an operation within one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u64);

impl OpId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// A node on one replica, by identifier and path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub side: ReplicaSide,
    pub id: NodeId,
    /// Normalized path relative to the replica root.
    pub path: PathBuf,
    pub node_type: NodeType,
}

/// One unit of work for the executor.
///
/// A propagation operation replays a change detected on `affected.side`
/// onto `target_side`. A fix-up operation (conflict rename, undo move,
/// rescue) has `affected.side == target_side` and acts on the item in
/// place.
#[derive(Debug, Clone)]
pub struct SyncOperation {
    pub id: OpId,
    pub op_type: OperationType,
    pub target_side: ReplicaSide,
    pub affected: NodeRef,
    /// Counterpart of `affected` on the other replica, when known.
    pub corresponding: Option<NodeRef>,
    pub db_id: Option<DbNodeId>,
    pub conflict: Option<Conflict>,
    /// Path the item had before a rescue or undo.
    pub origin_path: Option<PathBuf>,
    /// Name to give the item (conflict renames and undo moves).
    pub new_name: Option<SyncName>,
    /// Parent, on `target_side`, to move the item under.
    pub new_parent: Option<NodeId>,
    /// Apply to the store only.
    pub omit: bool,
    /// Drop the persisted row after success.
    pub forget_db: bool,
    /// Run the job but leave the store untouched.
    pub skip_db: bool,
    pub is_rescue: bool,
    pub is_breaking_cycle: bool,
    pub depends_on: Vec<OpId>,
}

impl SyncOperation {
    pub fn new(
        op_type: OperationType,
        target_side: ReplicaSide,
        affected: NodeRef,
        db_id: Option<DbNodeId>,
    ) -> Self {
        Self {
            id: OpId::new(0),
            op_type,
            target_side,
            affected,
            corresponding: None,
            db_id,
            conflict: None,
            origin_path: None,
            new_name: None,
            new_parent: None,
            omit: false,
            forget_db: false,
            skip_db: false,
            is_rescue: false,
            is_breaking_cycle: false,
            depends_on: Vec::new(),
        }
    }

    /// Side the change was observed on.
    pub fn source_side(&self) -> ReplicaSide {
        self.affected.side
    }

    /// True for conflict renames, undo moves and rescues.
    pub fn is_in_place(&self) -> bool {
        self.affected.side == self.target_side
    }

    pub fn is_dir(&self) -> bool {
        self.affected.node_type.is_dir()
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} on {} ({})",
            self.id,
            self.op_type,
            self.affected.path.display(),
            self.target_side,
            self.affected.id
        )
    }
}

/// Ordered operations of one cycle. Assigns ids on insertion.
#[derive(Debug, Clone, Default)]
pub struct SyncOperationList {
    ops: Vec<SyncOperation>,
    next_id: u64,
}

impl SyncOperationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `op` with a fresh id and returns that id.
    pub fn push(&mut self, mut op: SyncOperation) -> OpId {
        self.next_id += 1;
        op.id = OpId::new(self.next_id);
        let id = op.id;
        self.ops.push(op);
        id
    }

    /// Appends an operation taken out of this list earlier, keeping its id.
    pub fn requeue(&mut self, op: SyncOperation) {
        self.ops.push(op);
    }

    pub fn get(&self, id: OpId) -> Option<&SyncOperation> {
        self.ops.iter().find(|op| op.id == id)
    }

    pub fn get_mut(&mut self, id: OpId) -> Option<&mut SyncOperation> {
        self.ops.iter_mut().find(|op| op.id == id)
    }

    pub fn remove(&mut self, id: OpId) -> Option<SyncOperation> {
        let index = self.ops.iter().position(|op| op.id == id)?;
        Some(self.ops.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncOperation> {
        self.ops.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SyncOperation> {
        self.ops.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ids(&self) -> Vec<OpId> {
        self.ops.iter().map(|op| op.id).collect()
    }

    pub fn into_vec(self) -> Vec<SyncOperation> {
        self.ops
    }
}

impl IntoIterator for SyncOperationList {
    type Item = SyncOperation;
    type IntoIter = std::vec::IntoIter<SyncOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}
