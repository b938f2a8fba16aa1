//! Read-through cache over [`NodeStore`].
//!
//! The cache compares its loaded revision with the store's on every call and
//! rebuilds all of its maps in one pass when they differ. It is never patched
//! incrementally.

use crate::error::{StoreError, StoreResult};
use crate::node::PersistedNode;
use crate::store::NodeStore;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use twinsync_types::{DbNodeId, NodeId, ReplicaSide, SyncName};

#[derive(Default)]
struct CacheState {
    /// Store revision the maps were built from. `0` means never loaded.
    revision: u64,
    root: Option<DbNodeId>,
    nodes: HashMap<DbNodeId, PersistedNode>,
    local_ids: HashMap<NodeId, DbNodeId>,
    remote_ids: HashMap<NodeId, DbNodeId>,
    children: HashMap<DbNodeId, Vec<DbNodeId>>,
    paths: HashMap<(ReplicaSide, DbNodeId), PathBuf>,
}

impl CacheState {
    fn ids(&self, side: ReplicaSide) -> &HashMap<NodeId, DbNodeId> {
        match side {
            ReplicaSide::Local => &self.local_ids,
            ReplicaSide::Remote => &self.remote_ids,
        }
    }

    fn rebuild(&mut self, revision: u64, nodes: Vec<PersistedNode>) {
        *self = CacheState {
            revision,
            ..CacheState::default()
        };
        for node in nodes {
            let db_id = node.db_id;
            match node.parent_id {
                Some(parent) => self.children.entry(parent).or_default().push(db_id),
                None => self.root = Some(db_id),
            }
            if let Some(id) = &node.local_id {
                self.local_ids.insert(id.clone(), db_id);
            }
            if let Some(id) = &node.remote_id {
                self.remote_ids.insert(id.clone(), db_id);
            }
            self.nodes.insert(db_id, node);
        }
        for list in self.children.values_mut() {
            list.sort();
        }
    }

    fn path(&mut self, side: ReplicaSide, db_id: DbNodeId) -> Option<PathBuf> {
        if let Some(path) = self.paths.get(&(side, db_id)) {
            return Some(path.clone());
        }
        let mut names: Vec<&SyncName> = Vec::new();
        let mut current = self.nodes.get(&db_id)?;
        while let Some(parent) = current.parent_id {
            names.push(current.name(side));
            if names.len() > self.nodes.len() {
                warn!(db_id = %db_id, "parent chain loops in node store");
                return None;
            }
            current = self.nodes.get(&parent)?;
        }
        let path: PathBuf = names.iter().rev().map(|n| n.as_str()).collect();
        self.paths.insert((side, db_id), path.clone());
        Some(path)
    }
}

/// Cached, directional view of the persisted node map.
pub struct NodeCache {
    store: Arc<NodeStore>,
    state: Mutex<CacheState>,
}

impl NodeCache {
    pub fn new(store: Arc<NodeStore>) -> Self {
        Self {
            store,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    /// Revision of the currently loaded maps.
    pub fn cached_revision(&self) -> StoreResult<u64> {
        Ok(self.lock()?.revision)
    }

    pub fn is_up_to_date(&self) -> StoreResult<bool> {
        Ok(self.lock()?.revision == self.store.revision())
    }

    /// Reloads if the store moved. Returns false if the store is empty, in
    /// which case every lookup reports not found.
    pub fn reload_if_needed(&self) -> StoreResult<bool> {
        let mut state = self.lock()?;
        self.refresh(&mut state)?;
        Ok(!state.nodes.is_empty())
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, CacheState>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    fn refresh(&self, state: &mut CacheState) -> StoreResult<()> {
        let revision = self.store.revision();
        if state.revision == revision {
            return Ok(());
        }
        let nodes = self.store.all_nodes()?;
        if nodes.is_empty() {
            warn!("node store is empty; all lookups will report not found");
        }
        debug!(revision, nodes = nodes.len(), "reloading node cache");
        state.rebuild(revision, nodes);
        Ok(())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> StoreResult<R> {
        let mut state = self.lock()?;
        self.refresh(&mut state)?;
        Ok(f(&mut state))
    }

    // ── Lookups ──────────────────────────────────────────────────

    pub fn root_id(&self) -> StoreResult<Option<DbNodeId>> {
        self.with_state(|s| s.root)
    }

    pub fn node(&self, db_id: DbNodeId) -> StoreResult<Option<PersistedNode>> {
        self.with_state(|s| s.nodes.get(&db_id).cloned())
    }

    /// Internal id for a replica identifier.
    pub fn db_id(&self, side: ReplicaSide, id: &NodeId) -> StoreResult<Option<DbNodeId>> {
        self.with_state(|s| s.ids(side).get(id).copied())
    }

    pub fn node_by_side(
        &self,
        side: ReplicaSide,
        id: &NodeId,
    ) -> StoreResult<Option<PersistedNode>> {
        self.with_state(|s| {
            s.ids(side)
                .get(id)
                .and_then(|db_id| s.nodes.get(db_id))
                .cloned()
        })
    }

    /// Identifier, on the same side, of the persisted parent of `id`.
    pub fn parent(&self, side: ReplicaSide, id: &NodeId) -> StoreResult<Option<NodeId>> {
        self.with_state(|s| {
            let db_id = s.ids(side).get(id)?;
            let parent = s.nodes.get(db_id)?.parent_id?;
            s.nodes.get(&parent)?.id(side).cloned()
        })
    }

    pub fn parent_db_id(&self, db_id: DbNodeId) -> StoreResult<Option<DbNodeId>> {
        self.with_state(|s| s.nodes.get(&db_id).and_then(|n| n.parent_id))
    }

    /// Maps an identifier on `side` to its counterpart on the other side.
    pub fn corresponding_node_id(
        &self,
        side: ReplicaSide,
        id: &NodeId,
    ) -> StoreResult<Option<NodeId>> {
        self.with_state(|s| {
            let db_id = s.ids(side).get(id)?;
            s.nodes.get(db_id)?.id(side.other()).cloned()
        })
    }

    /// Every identifier recorded on `side`, sorted.
    pub fn ids(&self, side: ReplicaSide) -> StoreResult<Vec<NodeId>> {
        self.with_state(|s| {
            let mut ids: Vec<NodeId> = s.ids(side).keys().cloned().collect();
            ids.sort();
            ids
        })
    }

    /// Every node, ordered by internal id.
    pub fn all_nodes(&self) -> StoreResult<Vec<PersistedNode>> {
        self.with_state(|s| {
            let mut nodes: Vec<PersistedNode> = s.nodes.values().cloned().collect();
            nodes.sort_by_key(|n| n.db_id);
            nodes
        })
    }

    /// Last-synced relative path of a node, built from the names of `side`.
    pub fn path(&self, side: ReplicaSide, db_id: DbNodeId) -> StoreResult<Option<PathBuf>> {
        self.with_state(|s| s.path(side, db_id))
    }

    pub fn path_by_side(&self, side: ReplicaSide, id: &NodeId) -> StoreResult<Option<PathBuf>> {
        self.with_state(|s| {
            let db_id = *s.ids(side).get(id)?;
            s.path(side, db_id)
        })
    }

    /// Resolves a relative path against the names of `side`.
    pub fn id_by_path(&self, side: ReplicaSide, path: &Path) -> StoreResult<Option<NodeId>> {
        self.with_state(|s| {
            let mut current = s.root?;
            for component in path.components() {
                let Component::Normal(name) = component else {
                    continue;
                };
                let name = SyncName::new(&name.to_string_lossy());
                current = *s
                    .children
                    .get(&current)?
                    .iter()
                    .find(|child| s.nodes.get(*child).is_some_and(|n| *n.name(side) == name))?;
            }
            s.nodes.get(&current)?.id(side).cloned()
        })
    }

    pub fn children(&self, db_id: DbNodeId) -> StoreResult<Vec<DbNodeId>> {
        self.with_state(|s| s.children.get(&db_id).cloned().unwrap_or_default())
    }

    /// Every node below `db_id`, parents before their children.
    pub fn descendants(&self, db_id: DbNodeId) -> StoreResult<Vec<DbNodeId>> {
        self.with_state(|s| {
            let mut out = Vec::new();
            let mut stack: Vec<DbNodeId> = s.children.get(&db_id).cloned().unwrap_or_default();
            stack.reverse();
            while let Some(current) = stack.pop() {
                out.push(current);
                if let Some(children) = s.children.get(&current) {
                    stack.extend(children.iter().rev().copied());
                }
            }
            out
        })
    }

    /// Returns true if `ancestor` is a strict ancestor of `db_id`.
    pub fn is_ancestor(&self, ancestor: DbNodeId, db_id: DbNodeId) -> StoreResult<bool> {
        self.with_state(|s| {
            let mut current = s.nodes.get(&db_id).and_then(|n| n.parent_id);
            let mut steps = 0;
            while let Some(parent) = current {
                if parent == ancestor {
                    return true;
                }
                steps += 1;
                if steps > s.nodes.len() {
                    return false;
                }
                current = s.nodes.get(&parent).and_then(|n| n.parent_id);
            }
            false
        })
    }
}
