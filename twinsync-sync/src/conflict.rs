//! Conflict classification.
//!
//! A conflict is a pair of operations, one per replica, that cannot both be
//! replayed. [`classify`] decides the kind from the two operation types and
//! how the nodes relate; [`ConflictFinder`] enumerates the related pairs.

use crate::detector::{FsOperation, FsOperationSet};
use crate::error::SyncResult;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;
use twinsync_snapshot::Snapshot;
use twinsync_store::NodeCache;
use twinsync_types::{ConflictType, DbNodeId, NodeId, NodeType, OperationType, ReplicaSide};

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictNode {
    pub side: ReplicaSide,
    pub id: NodeId,
    pub db_id: Option<DbNodeId>,
    pub op_type: OperationType,
    pub node_type: NodeType,
    /// Normalized current path, or the persisted path of a deleted node.
    pub path: PathBuf,
    pub origin_path: Option<PathBuf>,
}

impl From<&FsOperation> for ConflictNode {
    fn from(op: &FsOperation) -> Self {
        Self {
            side: op.side,
            id: op.node_id.clone(),
            db_id: op.db_id,
            op_type: op.op_type,
            node_type: op.node_type,
            path: op.path.clone(),
            origin_path: op.origin_path.clone(),
        }
    }
}

/// A pair of incompatible changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub conflict_type: ConflictType,
    pub local: ConflictNode,
    pub remote: ConflictNode,
    /// Both changes lead to the same state; only the store needs updating.
    pub pseudo: bool,
}

impl Conflict {
    pub fn node(&self, side: ReplicaSide) -> &ConflictNode {
        match side {
            ReplicaSide::Local => &self.local,
            ReplicaSide::Remote => &self.remote,
        }
    }

    /// For the delete family, the side whose Delete wins.
    pub fn deleting_side(&self) -> Option<ReplicaSide> {
        if !self.conflict_type.is_delete_family() {
            return None;
        }
        ReplicaSide::ALL
            .into_iter()
            .find(|side| self.node(*side).op_type == OperationType::Delete)
    }

    /// Path used to order conflicts of the same type.
    pub fn priority_path(&self) -> &Path {
        match self.conflict_type {
            t if t.is_delete_family() => match self.deleting_side() {
                Some(side) => &self.node(side).path,
                None => &self.local.path,
            },
            ConflictType::MoveMoveSource => {
                self.local.origin_path.as_deref().unwrap_or(&self.local.path)
            }
            ConflictType::MoveCreate => {
                if self.local.op_type == OperationType::Create {
                    &self.local.path
                } else {
                    &self.remote.path
                }
            }
            _ => &self.local.path,
        }
    }

    fn sort_key(&self) -> (ConflictType, usize, &Path, &NodeId, &NodeId) {
        let path = self.priority_path();
        (
            self.conflict_type,
            path.components().count(),
            path,
            &self.local.id,
            &self.remote.id,
        )
    }
}

impl Ord for Conflict {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Conflict {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// How the two nodes of a candidate pair relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Both operations touch the same persisted node.
    SameNode,
    /// Different nodes end up at the same normalized path.
    SamePath,
    /// One node lands below a directory deleted on the other side.
    UnderDeletedParent,
    /// Two directory moves each land below the other's counterpart.
    CrossedMoves,
}

/// Conflict kind for a pair of operation types, if they conflict at all.
pub fn classify(
    local: OperationType,
    remote: OperationType,
    relation: Relation,
) -> Option<ConflictType> {
    use OperationType::{Create, Delete, Edit, Move};
    let pair = |a: OperationType, b: OperationType| {
        (local == a && remote == b) || (local == b && remote == a)
    };
    match relation {
        Relation::SameNode => {
            if pair(Edit, Edit) {
                Some(ConflictType::EditEdit)
            } else if pair(Edit, Delete) {
                Some(ConflictType::EditDelete)
            } else if pair(Move, Delete) {
                Some(ConflictType::MoveDelete)
            } else if pair(Move, Move) {
                Some(ConflictType::MoveMoveSource)
            } else {
                None
            }
        }
        Relation::SamePath => {
            if pair(Create, Create) {
                Some(ConflictType::CreateCreate)
            } else if pair(Move, Create) {
                Some(ConflictType::MoveCreate)
            } else if pair(Move, Move) {
                Some(ConflictType::MoveMoveDest)
            } else {
                None
            }
        }
        Relation::UnderDeletedParent => {
            if pair(Move, Delete) {
                Some(ConflictType::MoveParentDelete)
            } else if pair(Create, Delete) {
                Some(ConflictType::CreateParentDelete)
            } else {
                None
            }
        }
        Relation::CrossedMoves => pair(Move, Move).then_some(ConflictType::MoveMoveCycle),
    }
}

/// Same content as far as the replicas can tell.
fn same_content(a: &FsOperation, b: &FsOperation) -> bool {
    if a.size != b.size {
        return false;
    }
    match (&a.checksum, &b.checksum) {
        (Some(x), Some(y)) => x == y,
        _ => a.last_modified == b.last_modified,
    }
}

/// Enumerates conflicts between the two sides' operations.
pub struct ConflictFinder<'a> {
    cache: &'a NodeCache,
    local_ops: &'a FsOperationSet,
    remote_ops: &'a FsOperationSet,
    local: &'a Snapshot,
    remote: &'a Snapshot,
}

impl<'a> ConflictFinder<'a> {
    pub fn new(
        cache: &'a NodeCache,
        local_ops: &'a FsOperationSet,
        remote_ops: &'a FsOperationSet,
        local: &'a Snapshot,
        remote: &'a Snapshot,
    ) -> Self {
        Self {
            cache,
            local_ops,
            remote_ops,
            local,
            remote,
        }
    }

    fn ops(&self, side: ReplicaSide) -> &'a FsOperationSet {
        match side {
            ReplicaSide::Local => self.local_ops,
            ReplicaSide::Remote => self.remote_ops,
        }
    }

    fn snapshot(&self, side: ReplicaSide) -> &'a Snapshot {
        match side {
            ReplicaSide::Local => self.local,
            ReplicaSide::Remote => self.remote,
        }
    }

    /// Every conflict, sorted by priority.
    pub fn find(&self) -> SyncResult<Vec<Conflict>> {
        let mut conflicts = Vec::new();
        let mut seen: HashSet<(ConflictType, NodeId, NodeId)> = HashSet::new();
        let mut add = |conflict: Conflict| {
            let key = (
                conflict.conflict_type,
                conflict.local.id.clone(),
                conflict.remote.id.clone(),
            );
            if seen.insert(key) {
                conflicts.push(conflict);
            }
        };

        for conflict in self.same_node_conflicts() {
            add(conflict);
        }
        for conflict in self.same_path_conflicts() {
            add(conflict);
        }
        for conflict in self.parent_delete_conflicts()? {
            add(conflict);
        }
        for conflict in self.move_cycle_conflicts()? {
            add(conflict);
        }

        conflicts.sort();
        debug!(
            conflicts = conflicts.len(),
            pseudo = conflicts.iter().filter(|c| c.pseudo).count(),
            "conflict detection finished"
        );
        Ok(conflicts)
    }

    fn make(
        conflict_type: ConflictType,
        local: &FsOperation,
        remote: &FsOperation,
        pseudo: bool,
    ) -> Conflict {
        Conflict {
            conflict_type,
            local: local.into(),
            remote: remote.into(),
            pseudo,
        }
    }

    fn same_node_conflicts(&self) -> Vec<Conflict> {
        let mut out = Vec::new();
        for local in self.local_ops.iter() {
            let Some(db_id) = local.db_id else {
                continue;
            };
            for remote in self.remote_ops.ops_for_db(db_id) {
                let Some(conflict_type) =
                    classify(local.op_type, remote.op_type, Relation::SameNode)
                else {
                    continue;
                };
                let pseudo = match conflict_type {
                    ConflictType::EditEdit => same_content(local, remote),
                    ConflictType::MoveMoveSource => local.path == remote.path,
                    _ => false,
                };
                out.push(Self::make(conflict_type, local, remote, pseudo));
            }
        }
        out
    }

    fn same_path_conflicts(&self) -> Vec<Conflict> {
        let arrivals = |ops: &'a FsOperationSet| {
            let mut by_path: BTreeMap<&'a Path, Vec<&'a FsOperation>> = BTreeMap::new();
            for op in ops
                .iter()
                .filter(|op| matches!(op.op_type, OperationType::Create | OperationType::Move))
            {
                by_path.entry(op.destination()).or_default().push(op);
            }
            by_path
        };
        let remote_arrivals = arrivals(self.remote_ops);

        let mut out = Vec::new();
        for (path, locals) in arrivals(self.local_ops) {
            let Some(remotes) = remote_arrivals.get(path) else {
                continue;
            };
            for local in &locals {
                for remote in remotes {
                    if local.db_id.is_some() && local.db_id == remote.db_id {
                        continue;
                    }
                    let Some(conflict_type) =
                        classify(local.op_type, remote.op_type, Relation::SamePath)
                    else {
                        continue;
                    };
                    let pseudo = conflict_type == ConflictType::CreateCreate
                        && local.node_type == remote.node_type
                        && (local.node_type.is_dir() || same_content(local, remote));
                    out.push(Self::make(conflict_type, local, remote, pseudo));
                }
            }
        }
        out
    }

    fn parent_delete_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        let mut out = Vec::new();
        for side in ReplicaSide::ALL {
            let ops = self.ops(side);
            let other_ops = self.ops(side.other());
            let snapshot = self.snapshot(side);
            for op in ops
                .iter()
                .filter(|op| matches!(op.op_type, OperationType::Create | OperationType::Move))
            {
                if let Some(db_id) = op.db_id {
                    if other_ops.op_for_db(db_id, OperationType::Delete).is_some() {
                        continue;
                    }
                }
                let mut current = snapshot.parent_id(&op.node_id).cloned();
                while let Some(ancestor) = current {
                    if ancestor == *snapshot.root_id() {
                        break;
                    }
                    let deleted = match self.cache.db_id(side, &ancestor)? {
                        Some(db_id) => other_ops.op_for_db(db_id, OperationType::Delete),
                        None => None,
                    };
                    if let Some(delete) = deleted {
                        let Some(conflict_type) =
                            classify(op.op_type, delete.op_type, Relation::UnderDeletedParent)
                        else {
                            break;
                        };
                        let (local, remote) = match side {
                            ReplicaSide::Local => (op, delete),
                            ReplicaSide::Remote => (delete, op),
                        };
                        out.push(Self::make(conflict_type, local, remote, false));
                        break;
                    }
                    current = snapshot.parent_id(&ancestor).cloned();
                }
            }
        }
        Ok(out)
    }

    fn move_cycle_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        let dir_moves = |ops: &'a FsOperationSet| {
            ops.of_type(OperationType::Move)
                .filter(|op| op.node_type.is_dir() && op.db_id.is_some())
                .collect::<Vec<_>>()
        };
        let mut out = Vec::new();
        let remote_moves = dir_moves(self.remote_ops);
        for local in dir_moves(self.local_ops) {
            for remote in &remote_moves {
                let (Some(a), Some(b)) = (local.db_id, remote.db_id) else {
                    continue;
                };
                if a == b || self.cache.is_ancestor(a, b)? || self.cache.is_ancestor(b, a)? {
                    continue;
                }
                // Local counterpart of the remote-moved directory, and the
                // reverse.
                let b_local = self.cache.node(b)?.and_then(|n| n.local_id);
                let a_remote = self.cache.node(a)?.and_then(|n| n.remote_id);
                let (Some(b_local), Some(a_remote)) = (b_local, a_remote) else {
                    continue;
                };
                let local_under = self.local.is_ancestor(&b_local, &local.node_id);
                let remote_under = self.remote.is_ancestor(&a_remote, &remote.node_id);
                if local_under && remote_under {
                    if let Some(conflict_type) =
                        classify(local.op_type, remote.op_type, Relation::CrossedMoves)
                    {
                        out.push(Self::make(conflict_type, local, remote, false));
                    }
                }
            }
        }
        Ok(out)
    }
}
