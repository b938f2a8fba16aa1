//! Conflict resolution and operation planning.
//!
//! Turns the two sides' detected changes and their conflicts into one
//! ordered, dependency-annotated [`SyncOperationList`].
//!
//! # Architecture
//!
//! Conflicts are consumed in priority order. Each real conflict yields at
//! most a few fix-up operations (rescue, conflict rename, undo move) and
//! defers the conflicting nodes' ordinary changes to the next cycle. A node
//! consumed by one conflict is not touched by any later one. Pseudo-conflicts
//! and double deletes become store-only (`omit`) operations.
//!
//! Everything left is propagated to the other side, ordered Moves, Deletes,
//! Creates, Edits, then linked by [`link_dependencies`].

use crate::config::SyncConfig;
use crate::conflict::{Conflict, ConflictNode};
use crate::detector::{FsOperation, FsOperationSet};
use crate::error::SyncResult;
use crate::events::{ErrorSink, EventCause, SyncEvent};
use crate::naming::conflict_name;
use crate::operation::{NodeRef, OpId, SyncOperation, SyncOperationList};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, info};
use twinsync_snapshot::Snapshot;
use twinsync_store::NodeCache;
use twinsync_types::{ConflictType, NodeId, NodeType, OperationType, ReplicaSide};

/// Output of [`ConflictResolver::resolve`].
#[derive(Debug, Default)]
pub struct Resolution {
    pub ops: SyncOperationList,
    /// A real conflict was handled; another cycle should follow at once.
    pub needs_restart: bool,
    pub conflicts_resolved: usize,
}

type NodeKey = (ReplicaSide, NodeId);

#[derive(Default)]
struct Plan {
    ops: SyncOperationList,
    consumed: HashSet<NodeKey>,
    /// Every operation of these nodes is held back.
    suppressed: HashSet<NodeKey>,
    /// Only this operation type of the node is held back.
    suppressed_ops: HashSet<(ReplicaSide, NodeId, OperationType)>,
    /// Propagations that must wait for a fix-up operation.
    after_fix: HashMap<NodeKey, OpId>,
    needs_restart: bool,
    conflicts_resolved: usize,
}

impl Plan {
    fn is_suppressed(&self, op: &FsOperation) -> bool {
        self.suppressed.contains(&(op.side, op.node_id.clone()))
            || self
                .suppressed_ops
                .contains(&(op.side, op.node_id.clone(), op.op_type))
    }
}

pub struct ConflictResolver<'a> {
    cache: &'a NodeCache,
    config: &'a SyncConfig,
    events: &'a dyn ErrorSink,
    local: &'a Snapshot,
    remote: &'a Snapshot,
    local_ops: &'a FsOperationSet,
    remote_ops: &'a FsOperationSet,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(
        cache: &'a NodeCache,
        config: &'a SyncConfig,
        events: &'a dyn ErrorSink,
        (local, remote): (&'a Snapshot, &'a Snapshot),
        (local_ops, remote_ops): (&'a FsOperationSet, &'a FsOperationSet),
    ) -> Self {
        Self {
            cache,
            config,
            events,
            local,
            remote,
            local_ops,
            remote_ops,
        }
    }

    fn snapshot(&self, side: ReplicaSide) -> &'a Snapshot {
        match side {
            ReplicaSide::Local => self.local,
            ReplicaSide::Remote => self.remote,
        }
    }

    fn ops(&self, side: ReplicaSide) -> &'a FsOperationSet {
        match side {
            ReplicaSide::Local => self.local_ops,
            ReplicaSide::Remote => self.remote_ops,
        }
    }

    /// Plans the cycle. `conflicts` must be sorted by priority.
    pub fn resolve(&self, conflicts: &[Conflict]) -> SyncResult<Resolution> {
        let mut plan = Plan::default();

        for conflict in conflicts {
            if conflict.pseudo {
                self.absorb_pseudo(conflict, &mut plan)?;
            } else {
                self.resolve_conflict(conflict, &mut plan);
            }
        }
        self.absorb_double_deletes(&mut plan)?;
        self.propagate(&mut plan)?;
        link_dependencies(&mut plan.ops, self.local, self.remote);

        info!(
            ops = plan.ops.len(),
            conflicts = plan.conflicts_resolved,
            needs_restart = plan.needs_restart,
            "sync plan ready"
        );
        Ok(Resolution {
            ops: plan.ops,
            needs_restart: plan.needs_restart,
            conflicts_resolved: plan.conflicts_resolved,
        })
    }

    // ── Conflicts ────────────────────────────────────────────────

    fn node_ref(&self, node: &ConflictNode) -> NodeRef {
        NodeRef {
            side: node.side,
            id: node.id.clone(),
            path: node.path.clone(),
            node_type: node.node_type,
        }
    }

    /// Holds back every operation of `node` and of its current subtree.
    fn suppress_subtree(&self, side: ReplicaSide, id: &NodeId, plan: &mut Plan) {
        plan.suppressed.insert((side, id.clone()));
        plan.consumed.insert((side, id.clone()));
        for child in self.snapshot(side).descendants(id) {
            plan.suppressed.insert((side, child.clone()));
            plan.consumed.insert((side, child));
        }
    }

    fn resolve_conflict(&self, conflict: &Conflict, plan: &mut Plan) {
        let local_key = (ReplicaSide::Local, conflict.local.id.clone());
        let remote_key = (ReplicaSide::Remote, conflict.remote.id.clone());
        if plan.consumed.contains(&local_key) || plan.consumed.contains(&remote_key) {
            debug!(
                conflict = %conflict.conflict_type,
                path = %conflict.priority_path().display(),
                "conflict already covered by a higher-priority one"
            );
            return;
        }
        plan.consumed.insert(local_key.clone());
        plan.consumed.insert(remote_key.clone());
        plan.needs_restart = true;
        plan.conflicts_resolved += 1;

        let conflict_type = conflict.conflict_type;
        if let Some(deleting) = conflict.deleting_side() {
            self.resolve_delete_family(conflict, deleting, plan);
            return;
        }

        plan.suppressed.insert(local_key);
        plan.suppressed.insert(remote_key);
        let message = match conflict_type {
            ConflictType::MoveCreate => {
                let loser = if conflict.local.op_type == OperationType::Create {
                    &conflict.local
                } else {
                    &conflict.remote
                };
                self.push_rename(conflict, loser, plan);
                "an item was moved where another was created; the created one was renamed"
            }
            ConflictType::MoveMoveDest => {
                self.push_rename(conflict, &conflict.local, plan);
                "two items were moved to the same place; the local one was renamed"
            }
            ConflictType::CreateCreate => {
                self.push_rename(conflict, &conflict.local, plan);
                "an item was created on both sides; the local one was renamed"
            }
            ConflictType::EditEdit => {
                if let Some(id) = self.push_rename(conflict, &conflict.local, plan) {
                    if let Some(op) = plan.ops.get_mut(id) {
                        op.skip_db = false;
                        op.forget_db = true;
                    }
                }
                "a file was edited on both sides; the local version was renamed"
            }
            ConflictType::MoveMoveSource => {
                self.push_undo_move(conflict, false, plan);
                "an item was moved to different places; the local move was undone"
            }
            ConflictType::MoveMoveCycle => {
                if let Some(undo) = self.push_undo_move(conflict, true, plan) {
                    // The remote move goes ahead once the local one is undone.
                    plan.suppressed.remove(&(ReplicaSide::Remote, conflict.remote.id.clone()));
                    plan.after_fix
                        .insert((ReplicaSide::Remote, conflict.remote.id.clone()), undo);
                }
                "two folders were moved into each other; the local move was undone"
            }
            _ => "conflict",
        };
        self.report(conflict, EventCause::Conflict, message);
    }

    fn resolve_delete_family(&self, conflict: &Conflict, deleting: ReplicaSide, plan: &mut Plan) {
        let loser = conflict.node(deleting.other());
        let deleted = conflict.node(deleting);
        self.suppress_subtree(loser.side, &loser.id, plan);

        match loser.side {
            ReplicaSide::Local => {
                let mut op = SyncOperation::new(
                    OperationType::Move,
                    ReplicaSide::Local,
                    self.node_ref(loser),
                    loser.db_id,
                );
                op.is_rescue = true;
                op.forget_db = loser.db_id.is_some();
                op.origin_path = Some(loser.path.clone());
                op.conflict = Some(conflict.clone());
                plan.ops.push(op);
                // The rescued item itself must not be deleted afterwards.
                if deleted.db_id.is_some() && deleted.db_id == loser.db_id {
                    plan.suppressed_ops
                        .insert((deleting, deleted.id.clone(), OperationType::Delete));
                }
                self.report(
                    conflict,
                    EventCause::Conflict,
                    "an item changed locally was deleted remotely; the local content is rescued",
                );
            }
            ReplicaSide::Remote => {
                if self.push_remote_rescues(conflict, loser, plan) > 0 {
                    self.report(
                        conflict,
                        EventCause::Conflict,
                        "a remote change was deleted locally; the remote content is rescued",
                    );
                } else {
                    self.report(
                        conflict,
                        EventCause::RemoteChangeDiscarded,
                        "an item moved remotely was deleted locally; the move is discarded",
                    );
                }
            }
        }
    }

    /// Queues a download into the rescue folder for every remote file the
    /// local Delete would destroy: the losing file itself, or the created
    /// and edited files below a losing directory. Returns how many.
    fn push_remote_rescues(
        &self,
        conflict: &Conflict,
        loser: &ConflictNode,
        plan: &mut Plan,
    ) -> usize {
        let snapshot = self.remote;
        let files: Vec<NodeId> = if loser.node_type.is_dir() {
            snapshot
                .descendants(&loser.id)
                .into_iter()
                .filter(|id| {
                    snapshot.item(id).is_some_and(|item| !item.is_dir())
                        && (self.remote_ops.op(id, OperationType::Create).is_some()
                            || self.remote_ops.op(id, OperationType::Edit).is_some())
                })
                .collect()
        } else {
            vec![loser.id.clone()]
        };

        let mut pushed = 0;
        for id in files {
            let queued = plan.ops.iter().any(|op| {
                op.is_rescue && op.affected.side == ReplicaSide::Remote && op.affected.id == id
            });
            if queued {
                pushed += 1;
                continue;
            }
            let Ok(path) = snapshot.path(&id) else {
                continue;
            };
            let affected = NodeRef {
                side: ReplicaSide::Remote,
                id,
                path: path.clone(),
                node_type: NodeType::File,
            };
            let mut op =
                SyncOperation::new(OperationType::Create, ReplicaSide::Local, affected, None);
            op.is_rescue = true;
            op.origin_path = Some(path);
            op.conflict = Some(conflict.clone());
            plan.ops.push(op);
            pushed += 1;
        }
        pushed
    }

    /// Renames `node` in place on its own side. Returns the new op id.
    fn push_rename(
        &self,
        conflict: &Conflict,
        node: &ConflictNode,
        plan: &mut Plan,
    ) -> Option<OpId> {
        let snapshot = self.snapshot(node.side);
        let item = snapshot.item(&node.id)?;
        let parent = item.parent_id.clone()?;
        let mut op = SyncOperation::new(
            OperationType::Move,
            node.side,
            self.node_ref(node),
            node.db_id,
        );
        op.new_parent = Some(parent);
        op.new_name = Some(conflict_name(
            item.name(),
            &self.config.conflict_suffix,
            item.is_dir(),
        ));
        op.skip_db = true;
        op.origin_path = Some(node.path.clone());
        op.conflict = Some(conflict.clone());
        Some(plan.ops.push(op))
    }

    /// Moves the local node back to where the store last saw it, or to the
    /// root under a conflict name when that place is gone or taken.
    fn push_undo_move(
        &self,
        conflict: &Conflict,
        breaking_cycle: bool,
        plan: &mut Plan,
    ) -> Option<OpId> {
        let node = &conflict.local;
        let item = self.local.item(&node.id)?;
        let origin = node
            .db_id
            .and_then(|db_id| self.cache.node(db_id).ok().flatten())
            .and_then(|persisted| {
                let parent_db = persisted.parent_id?;
                let parent = self.cache.node(parent_db).ok().flatten()?.local_id?;
                Some((parent, persisted.name_local))
            });
        let origin = origin.filter(|(parent, name)| {
            self.local.contains(parent)
                && !self.local.is_ancestor(&node.id, parent)
                && self
                    .local
                    .child_by_name(parent, name)
                    .is_none_or(|existing| *existing == node.id)
        });
        let (new_parent, new_name) = match origin {
            Some(origin) => origin,
            None => (
                self.local.root_id().clone(),
                conflict_name(item.name(), &self.config.conflict_suffix, item.is_dir()),
            ),
        };

        let mut op = SyncOperation::new(
            OperationType::Move,
            ReplicaSide::Local,
            self.node_ref(node),
            node.db_id,
        );
        op.new_parent = Some(new_parent);
        op.new_name = Some(new_name);
        op.skip_db = true;
        op.is_breaking_cycle = breaking_cycle;
        op.origin_path = node.origin_path.clone();
        op.conflict = Some(conflict.clone());
        Some(plan.ops.push(op))
    }

    fn report(&self, conflict: &Conflict, cause: EventCause, message: &str) {
        self.events.report(
            SyncEvent::new(cause, conflict.priority_path(), message)
                .on(ReplicaSide::Local, conflict.local.id.clone())
                .with_conflict(conflict.conflict_type),
        );
    }

    // ── Store-only operations ────────────────────────────────────

    fn absorb_pseudo(&self, conflict: &Conflict, plan: &mut Plan) -> SyncResult<()> {
        let local_key = (ReplicaSide::Local, conflict.local.id.clone());
        let remote_key = (ReplicaSide::Remote, conflict.remote.id.clone());
        if plan.consumed.contains(&local_key) || plan.consumed.contains(&remote_key) {
            return Ok(());
        }
        let op_type = match conflict.conflict_type {
            ConflictType::CreateCreate => OperationType::Create,
            ConflictType::EditEdit => OperationType::Edit,
            ConflictType::MoveMoveSource => OperationType::Move,
            _ => return Ok(()),
        };
        // A pseudo CreateCreate under a directory that is itself waiting is
        // left for the next cycle.
        if op_type == OperationType::Create
            && !self.parent_ready(ReplicaSide::Local, &conflict.local.id, plan)?
        {
            return Ok(());
        }
        plan.consumed.insert(local_key);
        plan.consumed.insert(remote_key);
        plan.suppressed_ops
            .insert((ReplicaSide::Local, conflict.local.id.clone(), op_type));
        plan.suppressed_ops
            .insert((ReplicaSide::Remote, conflict.remote.id.clone(), op_type));

        let mut op = SyncOperation::new(
            op_type,
            ReplicaSide::Remote,
            self.node_ref(&conflict.local),
            conflict.local.db_id,
        );
        op.corresponding = Some(self.node_ref(&conflict.remote));
        op.omit = true;
        op.conflict = Some(conflict.clone());
        debug!(
            conflict = %conflict.conflict_type,
            path = %conflict.local.path.display(),
            "pseudo-conflict"
        );
        plan.ops.push(op);
        Ok(())
    }

    /// A node deleted on both sides only needs its row dropped.
    fn absorb_double_deletes(&self, plan: &mut Plan) -> SyncResult<()> {
        for local in self.local_ops.of_type(OperationType::Delete) {
            let Some(db_id) = local.db_id else {
                continue;
            };
            let Some(remote) = self.remote_ops.op_for_db(db_id, OperationType::Delete) else {
                continue;
            };
            plan.suppressed_ops
                .insert((ReplicaSide::Local, local.node_id.clone(), OperationType::Delete));
            plan.suppressed_ops
                .insert((ReplicaSide::Remote, remote.node_id.clone(), OperationType::Delete));
            let parent_gone_too = self.cache.parent_db_id(db_id)?.is_some_and(|parent| {
                self.local_ops.op_for_db(parent, OperationType::Delete).is_some()
                    && self.remote_ops.op_for_db(parent, OperationType::Delete).is_some()
            });
            if parent_gone_too {
                continue;
            }
            let mut op = SyncOperation::new(
                OperationType::Delete,
                ReplicaSide::Remote,
                fs_node_ref(local),
                Some(db_id),
            );
            op.corresponding = Some(fs_node_ref(remote));
            op.omit = true;
            plan.ops.push(op);
        }
        Ok(())
    }

    // ── Propagation ──────────────────────────────────────────────

    /// True if the parent of `id` exists on the other side already, gets
    /// created earlier in this plan, or has a Create of its own that is
    /// ready to propagate.
    fn parent_ready(&self, side: ReplicaSide, id: &NodeId, plan: &Plan) -> SyncResult<bool> {
        let snapshot = self.snapshot(side);
        let Some(parent) = snapshot.parent_id(id) else {
            return Ok(false);
        };
        if parent == snapshot.root_id() {
            return Ok(true);
        }
        if plan.suppressed.contains(&(side, parent.clone())) {
            return Ok(false);
        }
        if self.cache.db_id(side, parent)?.is_some() {
            return Ok(true);
        }
        let planned = plan.ops.iter().any(|op| {
            op.op_type == OperationType::Create
                && !op.is_rescue
                && ((op.affected.side == side && op.affected.id == *parent)
                    || op
                        .corresponding
                        .as_ref()
                        .is_some_and(|c| c.side == side && c.id == *parent))
        });
        if planned {
            return Ok(true);
        }
        // Moves are propagated before Creates; a Move into a new directory
        // relies on that directory's Create being queued later on.
        match self.ops(side).op(parent, OperationType::Create) {
            Some(pending) if !plan.is_suppressed(pending) => {
                self.parent_ready(side, parent, plan)
            }
            _ => Ok(false),
        }
    }

    fn propagate(&self, plan: &mut Plan) -> SyncResult<()> {
        let order = [
            OperationType::Move,
            OperationType::Delete,
            OperationType::Create,
            OperationType::Edit,
        ];
        for op_type in order {
            for side in ReplicaSide::ALL {
                for fs_op in self.ops(side).of_type(op_type) {
                    if plan.is_suppressed(fs_op) {
                        continue;
                    }
                    match op_type {
                        OperationType::Delete => {
                            // Only the top-most Delete of a subtree is replayed.
                            let parent = match fs_op.db_id {
                                Some(db_id) => self.cache.parent_db_id(db_id)?,
                                None => None,
                            };
                            let covered = parent.is_some_and(|parent| {
                                self.ops(side).op_for_db(parent, OperationType::Delete).is_some()
                            });
                            if covered {
                                continue;
                            }
                        }
                        OperationType::Create | OperationType::Move => {
                            if !self.parent_ready(side, &fs_op.node_id, plan)? {
                                debug!(
                                    side = %side,
                                    op = ?op_type,
                                    path = %fs_op.path.display(),
                                    "parent not available yet, deferring"
                                );
                                continue;
                            }
                        }
                        _ => {}
                    }

                    let mut op =
                        SyncOperation::new(op_type, side.other(), fs_node_ref(fs_op), fs_op.db_id);
                    op.origin_path = fs_op.origin_path.clone();
                    if let Some(db_id) = fs_op.db_id {
                        let counterpart = self
                            .cache
                            .node(db_id)?
                            .and_then(|n| n.id(side.other()).cloned());
                        if let Some(id) = counterpart {
                            op.corresponding = Some(NodeRef {
                                side: side.other(),
                                id,
                                path: self.cache.path(side.other(), db_id)?.unwrap_or_default(),
                                node_type: fs_op.node_type,
                            });
                        }
                    }
                    if let Some(fix) = plan.after_fix.get(&(side, fs_op.node_id.clone())) {
                        op.depends_on.push(*fix);
                    }
                    plan.ops.push(op);
                }
            }
        }
        Ok(())
    }
}

fn fs_node_ref(op: &FsOperation) -> NodeRef {
    NodeRef {
        side: op.side,
        id: op.node_id.clone(),
        path: op.path.clone(),
        node_type: op.node_type,
    }
}

/// Fills `depends_on` for every operation of `ops`.
///
/// - a Create or Move waits for the Create of its new parent;
/// - a Create or Move waits for whatever frees its destination path;
/// - a Delete waits for Moves out of the deleted directory;
/// - a Delete waits for every rescue.
pub fn link_dependencies(ops: &mut SyncOperationList, local: &Snapshot, remote: &Snapshot) {
    let snapshot = |side: ReplicaSide| match side {
        ReplicaSide::Local => local,
        ReplicaSide::Remote => remote,
    };

    let mut creates: HashMap<NodeKey, OpId> = HashMap::new();
    for op in ops
        .iter()
        .filter(|op| op.op_type == OperationType::Create && !op.is_rescue)
    {
        creates.insert((op.affected.side, op.affected.id.clone()), op.id);
        if let Some(other) = &op.corresponding {
            creates.insert((other.side, other.id.clone()), op.id);
        }
    }
    let rescues: Vec<OpId> = ops.iter().filter(|op| op.is_rescue).map(|op| op.id).collect();

    // (target side, freed path, op)
    let frees: Vec<(ReplicaSide, PathBuf, OpId)> = ops
        .iter()
        .filter_map(|op| {
            let path = match op.op_type {
                OperationType::Delete if !op.omit => op.affected.path.clone(),
                OperationType::Move if op.is_in_place() => op.affected.path.clone(),
                OperationType::Move => op.origin_path.clone()?,
                _ => return None,
            };
            Some((op.target_side, path, op.id))
        })
        .collect();
    let moves_out: Vec<(ReplicaSide, PathBuf, OpId)> = ops
        .iter()
        .filter(|op| op.op_type == OperationType::Move)
        .filter_map(|op| {
            let from = if op.is_in_place() {
                op.affected.path.clone()
            } else {
                op.origin_path.clone()?
            };
            Some((op.target_side, from, op.id))
        })
        .collect();

    let mut links: Vec<(OpId, Vec<OpId>)> = Vec::new();
    for op in ops.iter() {
        let mut deps: Vec<OpId> = Vec::new();
        match op.op_type {
            OperationType::Create | OperationType::Move
                if !op.omit && !op.is_in_place() && !op.is_rescue =>
            {
                let parent = snapshot(op.affected.side).parent_id(&op.affected.id);
                let parent_op = parent.and_then(|p| creates.get(&(op.affected.side, p.clone())));
                if let Some(parent_op) = parent_op {
                    deps.push(*parent_op);
                }
                for (side, path, id) in &frees {
                    if *side == op.target_side && *path == op.affected.path {
                        deps.push(*id);
                    }
                }
            }
            OperationType::Delete if !op.omit => {
                for (side, from, id) in &moves_out {
                    if *side == op.target_side
                        && from.starts_with(&op.affected.path)
                        && *from != op.affected.path
                    {
                        deps.push(*id);
                    }
                }
                deps.extend(rescues.iter().copied());
            }
            _ => {}
        }
        deps.retain(|d| *d != op.id);
        if !deps.is_empty() {
            links.push((op.id, deps));
        }
    }

    for (id, deps) in links {
        if let Some(op) = ops.get_mut(id) {
            for dep in deps {
                if !op.depends_on.contains(&dep) {
                    op.depends_on.push(dep);
                }
            }
        }
    }
}
