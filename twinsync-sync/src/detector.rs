//! Change detection.
//!
//! Compares a frozen replica snapshot with the persisted node map and turns
//! the difference into [`FsOperation`]s for that side.
//!
//! # Architecture
//!
//! Three passes, in this order:
//!
//! 1. Every persisted node with an identifier on the side is looked up in
//!    the snapshot. Missing nodes become Deletes (expanded over their
//!    persisted descendants); present nodes may yield a Move and/or an Edit.
//! 2. Snapshot items with no persisted record become Creates, walked parent
//!    first so an excluded directory hides its whole subtree.
//! 3. Operations are indexed by node and by internal id for the conflict
//!    finder.

use crate::error::SyncResult;
use crate::events::{ErrorSink, EventCause, SyncEvent};
use crate::exclusion::{Exclusion, ExclusionRules, TmpBlacklist};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use twinsync_snapshot::{Snapshot, SnapshotError};
use twinsync_store::{NodeCache, PersistedNode};
use twinsync_types::{DbNodeId, NodeId, NodeType, OperationType, ReplicaSide, SyncTime};

/// A change detected on one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsOperation {
    pub op_type: OperationType,
    pub side: ReplicaSide,
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub db_id: Option<DbNodeId>,
    /// Normalized path: the current one, or the persisted one for a Delete.
    pub path: PathBuf,
    /// Persisted path before a Move.
    pub origin_path: Option<PathBuf>,
    pub created_at: SyncTime,
    pub last_modified: SyncTime,
    pub size: u64,
    pub checksum: Option<String>,
}

impl FsOperation {
    /// Destination path for a Move or Create, current path otherwise.
    pub fn destination(&self) -> &Path {
        &self.path
    }
}

/// The operations detected on one side during a cycle.
#[derive(Debug, Clone)]
pub struct FsOperationSet {
    side: ReplicaSide,
    ops: Vec<FsOperation>,
    by_node: HashMap<NodeId, Vec<usize>>,
    by_db: HashMap<DbNodeId, Vec<usize>>,
}

impl FsOperationSet {
    pub fn new(side: ReplicaSide) -> Self {
        Self {
            side,
            ops: Vec::new(),
            by_node: HashMap::new(),
            by_db: HashMap::new(),
        }
    }

    pub fn side(&self) -> ReplicaSide {
        self.side
    }

    pub fn push(&mut self, op: FsOperation) {
        let index = self.ops.len();
        self.by_node.entry(op.node_id.clone()).or_default().push(index);
        if let Some(db_id) = op.db_id {
            self.by_db.entry(db_id).or_default().push(index);
        }
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FsOperation> {
        self.ops.iter()
    }

    pub fn of_type(&self, op_type: OperationType) -> impl Iterator<Item = &FsOperation> {
        self.ops.iter().filter(move |op| op.op_type == op_type)
    }

    pub fn ops_for_node(&self, id: &NodeId) -> impl Iterator<Item = &FsOperation> {
        self.by_node
            .get(id)
            .into_iter()
            .flatten()
            .map(|i| &self.ops[*i])
    }

    pub fn ops_for_db(&self, db_id: DbNodeId) -> impl Iterator<Item = &FsOperation> {
        self.by_db
            .get(&db_id)
            .into_iter()
            .flatten()
            .map(|i| &self.ops[*i])
    }

    pub fn op(&self, id: &NodeId, op_type: OperationType) -> Option<&FsOperation> {
        self.ops_for_node(id).find(|op| op.op_type == op_type)
    }

    pub fn op_for_db(&self, db_id: DbNodeId, op_type: OperationType) -> Option<&FsOperation> {
        self.ops_for_db(db_id).find(|op| op.op_type == op_type)
    }

    pub fn count(&self, op_type: OperationType) -> usize {
        self.of_type(op_type).count()
    }
}

/// Diffs one replica against the persisted node map.
pub struct ChangeDetector<'a> {
    cache: &'a NodeCache,
    exclusions: &'a ExclusionRules,
    blacklist: &'a TmpBlacklist,
    rescue_folder: &'a str,
    events: Option<&'a dyn ErrorSink>,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(
        cache: &'a NodeCache,
        exclusions: &'a ExclusionRules,
        blacklist: &'a TmpBlacklist,
        rescue_folder: &'a str,
    ) -> Self {
        Self {
            cache,
            exclusions,
            blacklist,
            rescue_folder,
            events: None,
        }
    }

    /// Reports pattern exclusions of new items to `events`.
    #[must_use]
    pub fn with_events(mut self, events: &'a dyn ErrorSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn detect(&self, snapshot: &Snapshot) -> SyncResult<FsOperationSet> {
        let side = snapshot.side();
        let mut ops = FsOperationSet::new(side);
        self.cache.reload_if_needed()?;

        self.infer_changes_and_deletes(snapshot, &mut ops)?;
        self.infer_creates(snapshot, &mut ops)?;

        debug!(
            side = %side,
            creates = ops.count(OperationType::Create),
            deletes = ops.count(OperationType::Delete),
            moves = ops.count(OperationType::Move),
            edits = ops.count(OperationType::Edit),
            "change detection finished"
        );
        Ok(ops)
    }

    // ── Rules 1 and 3 ────────────────────────────────────────────

    fn infer_changes_and_deletes(
        &self,
        snapshot: &Snapshot,
        ops: &mut FsOperationSet,
    ) -> SyncResult<()> {
        let side = snapshot.side();
        let mut deleted: HashSet<DbNodeId> = HashSet::new();

        for node in self.cache.all_nodes()? {
            if node.is_root() || deleted.contains(&node.db_id) {
                continue;
            }
            let Some(id) = node.id(side).cloned() else {
                continue;
            };
            if self.blacklist.is_blacklisted(side, &id) {
                continue;
            }

            if !snapshot.contains(&id) {
                self.push_delete(&node, &id, ops)?;
                deleted.insert(node.db_id);
                self.expand_delete(snapshot, &node, ops, &mut deleted)?;
                continue;
            }

            let Some(item) = snapshot.item(&id) else {
                continue;
            };
            let path = match snapshot.normalized_path(&id) {
                Ok(path) => path,
                Err(err) if err.is_ignored() => {
                    warn!(
                        side = %side,
                        id = %id,
                        error = %err,
                        "skipping item with an ignored path"
                    );
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let persisted_parent = self.cache.parent(side, &id)?;
            let moved = item.parent_id.as_ref() != persisted_parent.as_ref()
                || item.normalized_name() != node.name(side);
            let base = FsOperation {
                op_type: OperationType::Move,
                side,
                node_id: id.clone(),
                node_type: item.node_type,
                db_id: Some(node.db_id),
                path,
                origin_path: None,
                created_at: item.created_at,
                last_modified: item.last_modified,
                size: item.size,
                checksum: item.content_checksum.clone(),
            };
            if moved {
                ops.push(FsOperation {
                    origin_path: self.cache.path(side, node.db_id)?,
                    ..base.clone()
                });
            }
            if !item.is_dir()
                && content_changed(
                    &node,
                    side,
                    item.last_modified,
                    item.size,
                    &item.content_checksum,
                )
            {
                ops.push(FsOperation {
                    op_type: OperationType::Edit,
                    ..base
                });
            }
        }
        Ok(())
    }

    fn push_delete(
        &self,
        node: &PersistedNode,
        id: &NodeId,
        ops: &mut FsOperationSet,
    ) -> SyncResult<()> {
        let path = self.cache.path(ops.side(), node.db_id)?.unwrap_or_default();
        ops.push(FsOperation {
            op_type: OperationType::Delete,
            side: ops.side(),
            node_id: id.clone(),
            node_type: node.node_type,
            db_id: Some(node.db_id),
            path,
            origin_path: None,
            created_at: node.created.unwrap_or(0),
            last_modified: node.last_modified(ops.side()).unwrap_or(0),
            size: node.size,
            checksum: node.checksum.clone(),
        });
        Ok(())
    }

    /// One Delete per persisted descendant that is gone from the snapshot.
    /// Descendants still present elsewhere are left to the move check.
    fn expand_delete(
        &self,
        snapshot: &Snapshot,
        node: &PersistedNode,
        ops: &mut FsOperationSet,
        deleted: &mut HashSet<DbNodeId>,
    ) -> SyncResult<()> {
        if !node.node_type.is_dir() {
            return Ok(());
        }
        let side = snapshot.side();
        for db_id in self.cache.descendants(node.db_id)? {
            if !deleted.insert(db_id) {
                continue;
            }
            let Some(child) = self.cache.node(db_id)? else {
                continue;
            };
            let Some(id) = child.id(side) else {
                continue;
            };
            if snapshot.contains(id) {
                deleted.remove(&db_id);
                continue;
            }
            self.push_delete(&child, id, ops)?;
        }
        Ok(())
    }

    // ── Rule 2 ───────────────────────────────────────────────────

    fn infer_creates(&self, snapshot: &Snapshot, ops: &mut FsOperationSet) -> SyncResult<()> {
        let side = snapshot.side();
        let mut stack = snapshot.children_ids(snapshot.root_id());
        stack.reverse();

        while let Some(id) = stack.pop() {
            let Some(item) = snapshot.item(&id) else {
                continue;
            };
            let parent_is_root = item.parent_id.as_ref() == Some(snapshot.root_id());
            if side == ReplicaSide::Local && parent_is_root && item.name() == self.rescue_folder {
                continue;
            }

            let known = self.cache.db_id(side, &id)?.is_some();
            if !known {
                let path = match snapshot.normalized_path(&id) {
                    Ok(path) => path,
                    Err(SnapshotError::IgnoredPath { component, .. }) => {
                        warn!(
                            side = %side,
                            id = %id,
                            component,
                            "skipping item with an ignored name"
                        );
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };
                if let Some(exclusion) = self.exclusions.check(side, item, &path, self.blacklist) {
                    debug!(
                        side = %side,
                        path = %path.display(),
                        reason = %exclusion,
                        "item excluded"
                    );
                    if exclusion != Exclusion::TmpBlacklisted {
                        if let Some(events) = self.events {
                            events.report(
                                SyncEvent::new(EventCause::Excluded, path, exclusion.to_string())
                                    .on(side, id.clone()),
                            );
                        }
                    }
                    continue;
                }
                ops.push(FsOperation {
                    op_type: OperationType::Create,
                    side,
                    node_id: id.clone(),
                    node_type: item.node_type,
                    db_id: None,
                    path,
                    origin_path: None,
                    created_at: item.created_at,
                    last_modified: item.last_modified,
                    size: item.size,
                    checksum: item.content_checksum.clone(),
                });
            }

            if item.is_dir() {
                let mut children = snapshot.children_ids(&id);
                children.reverse();
                stack.extend(children);
            }
        }
        Ok(())
    }
}

fn content_changed(
    node: &PersistedNode,
    side: ReplicaSide,
    last_modified: SyncTime,
    size: u64,
    checksum: &Option<String>,
) -> bool {
    if node.last_modified(side) != Some(last_modified) || node.size != size {
        return true;
    }
    matches!((&node.checksum, checksum), (Some(a), Some(b)) if a != b)
}
