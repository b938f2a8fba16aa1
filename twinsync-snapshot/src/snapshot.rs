//! Arena-backed replica tree.

use crate::error::{SnapshotError, SnapshotResult};
use crate::item::SnapshotItem;
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use twinsync_types::{NodeId, ReplicaSide, SyncName};

/// Generational index into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Handle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
struct Entry {
    item: SnapshotItem,
    parent: Option<Handle>,
    children: BTreeSet<Handle>,
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PathKind {
    Raw,
    Normalized,
}

/// Current state of one replica.
///
/// A snapshot is either live (mutated by its observer) or a frozen copy
/// (read-only, may cache reconstructed paths).
#[derive(Debug)]
pub struct Snapshot {
    side: ReplicaSide,
    root_id: NodeId,
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: HashMap<NodeId, Handle>,
    revision: u64,
    frozen: bool,
    path_cache: Mutex<HashMap<(NodeId, PathKind), PathBuf>>,
}

impl Snapshot {
    /// Creates a snapshot holding only the root directory.
    pub fn new(side: ReplicaSide, root_id: impl Into<NodeId>) -> Self {
        let root_id = root_id.into();
        let mut snapshot = Self {
            side,
            root_id: root_id.clone(),
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            revision: 0,
            frozen: false,
            path_cache: Mutex::new(HashMap::new()),
        };
        let handle = snapshot.alloc(Entry {
            item: SnapshotItem::root(root_id.clone()),
            parent: None,
            children: BTreeSet::new(),
        });
        snapshot.index.insert(root_id, handle);
        snapshot
    }

    pub fn side(&self) -> ReplicaSide {
        self.side
    }

    pub fn root_id(&self) -> &NodeId {
        &self.root_id
    }

    /// Monotonic counter bumped by every successful mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Number of items, root included.
    pub fn nb_items(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn item(&self, id: &NodeId) -> Option<&SnapshotItem> {
        self.entry(id).map(|e| &e.item)
    }

    pub fn parent_id(&self, id: &NodeId) -> Option<&NodeId> {
        self.item(id).and_then(|i| i.parent_id.as_ref())
    }

    /// All ids, sorted.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.index.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Direct children of `id`, sorted.
    pub fn children_ids(&self, id: &NodeId) -> Vec<NodeId> {
        let Some(entry) = self.entry(id) else {
            return Vec::new();
        };
        let mut ids: Vec<NodeId> = entry
            .children
            .iter()
            .filter_map(|h| self.resolve(*h))
            .map(|e| e.item.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every item below `id`, parents before their children.
    pub fn descendants(&self, id: &NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = self.children_ids(id);
        stack.reverse();
        while let Some(cur) = stack.pop() {
            let mut children = self.children_ids(&cur);
            children.reverse();
            out.push(cur);
            stack.extend(children);
        }
        out
    }

    /// Looks up a direct child by (normalized) name.
    pub fn child_by_name(&self, parent: &NodeId, name: &SyncName) -> Option<&NodeId> {
        let entry = self.entry(parent)?;
        entry
            .children
            .iter()
            .filter_map(|h| self.resolve(*h))
            .find(|e| e.item.normalized_name() == name)
            .map(|e| &e.item.id)
    }

    /// Resolves a relative path to an id, matching names in normalized form.
    pub fn id_by_path(&self, path: &Path) -> Option<&NodeId> {
        let mut current = &self.root_id;
        for component in path.components() {
            match component {
                Component::Normal(name) => {
                    let name = SyncName::new(&name.to_string_lossy());
                    current = self.child_by_name(current, &name)?;
                }
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(current)
    }

    /// Returns true if `candidate` is a strict ancestor of `id`.
    pub fn is_ancestor(&self, candidate: &NodeId, id: &NodeId) -> bool {
        let Some(target) = self.handle(candidate) else {
            return false;
        };
        let mut current = self.entry(id).and_then(|e| e.parent);
        let mut steps = 0;
        while let Some(handle) = current {
            if handle == target {
                return true;
            }
            steps += 1;
            if steps > self.index.len() {
                return false;
            }
            current = self.resolve(handle).and_then(|e| e.parent);
        }
        false
    }

    // ── Mutation ─────────────────────────────────────────────────

    /// Inserts or replaces an item, re-linking it under its parent.
    pub fn update_item(&mut self, mut item: SnapshotItem) -> SnapshotResult<()> {
        self.ensure_mutable()?;

        if item.id == self.root_id {
            if item.parent_id.is_some() {
                return Err(SnapshotError::RootWithParent(item.id));
            }
            let handle = self.require(&item.id)?;
            self.revision += 1;
            item.stamp(self.revision);
            if let Some(entry) = self.resolve_mut(handle) {
                entry.item = item;
            }
            return Ok(());
        }

        let parent_id = item.parent_id.clone().ok_or_else(|| SnapshotError::MissingParent {
            id: item.id.clone(),
            parent: None,
        })?;
        let parent_handle = self
            .handle(&parent_id)
            .ok_or_else(|| SnapshotError::MissingParent {
                id: item.id.clone(),
                parent: Some(parent_id.clone()),
            })?;
        let parent_is_dir = self
            .resolve(parent_handle)
            .is_some_and(|e| e.item.is_dir());
        if !parent_is_dir {
            return Err(SnapshotError::ParentNotDirectory {
                id: item.id.clone(),
                parent: parent_id,
            });
        }

        match self.handle(&item.id) {
            Some(handle) => {
                if parent_id == item.id || self.is_ancestor(&item.id, &parent_id) {
                    return Err(SnapshotError::Cycle {
                        id: item.id.clone(),
                        parent: parent_id,
                    });
                }
                let (old_parent, has_children) = match self.resolve(handle) {
                    Some(e) => (e.parent, !e.children.is_empty()),
                    None => return Err(SnapshotError::NotFound(item.id.clone())),
                };
                if !item.is_dir() && has_children {
                    return Err(SnapshotError::TypeChangeWithChildren(item.id.clone()));
                }
                if old_parent != Some(parent_handle) {
                    if let Some(old) = old_parent.and_then(|p| self.resolve_mut(p)) {
                        old.children.remove(&handle);
                    }
                    if let Some(new_parent) = self.resolve_mut(parent_handle) {
                        new_parent.children.insert(handle);
                    }
                }
                self.revision += 1;
                item.stamp(self.revision);
                if let Some(entry) = self.resolve_mut(handle) {
                    entry.parent = Some(parent_handle);
                    entry.item = item;
                }
            }
            None => {
                self.revision += 1;
                item.stamp(self.revision);
                let id = item.id.clone();
                let handle = self.alloc(Entry {
                    item,
                    parent: Some(parent_handle),
                    children: BTreeSet::new(),
                });
                self.index.insert(id, handle);
                if let Some(parent) = self.resolve_mut(parent_handle) {
                    parent.children.insert(handle);
                }
            }
        }
        Ok(())
    }

    /// Removes an item and its whole subtree.
    pub fn remove_item(&mut self, id: &NodeId) -> SnapshotResult<()> {
        self.ensure_mutable()?;
        if *id == self.root_id {
            return Err(SnapshotError::RootRemoval);
        }
        let top = self.require(id)?;

        if let Some(parent) = self.resolve(top).and_then(|e| e.parent) {
            if let Some(parent_entry) = self.resolve_mut(parent) {
                parent_entry.children.remove(&top);
            }
        }

        // Pre-order walk; released in reverse so children go before parents.
        let mut order = Vec::new();
        let mut stack = vec![top];
        while let Some(handle) = stack.pop() {
            order.push(handle);
            if let Some(entry) = self.resolve(handle) {
                stack.extend(entry.children.iter().copied());
            }
        }

        let removed = order.len();
        for handle in order.into_iter().rev() {
            if handle != top {
                if let Some(parent) = self.resolve(handle).and_then(|e| e.parent) {
                    if let Some(parent_entry) = self.resolve_mut(parent) {
                        parent_entry.children.remove(&handle);
                    }
                }
            }
            let item = self.release(handle)?;
            self.index.remove(&item.id);
        }

        self.revision += 1;
        debug!(side = %self.side, id = %id, removed, "removed snapshot subtree");
        Ok(())
    }

    // ── Paths ────────────────────────────────────────────────────

    /// Path of `id` relative to the replica root, built from raw names.
    ///
    /// Fails with [`SnapshotError::IgnoredPath`] if a component cannot exist
    /// on this platform.
    pub fn path(&self, id: &NodeId) -> SnapshotResult<PathBuf> {
        self.build_path(id, PathKind::Raw)
    }

    /// Same as [`path`](Self::path) but from normalized names, for
    /// cross-replica comparisons.
    pub fn normalized_path(&self, id: &NodeId) -> SnapshotResult<PathBuf> {
        self.build_path(id, PathKind::Normalized)
    }

    fn build_path(&self, id: &NodeId, kind: PathKind) -> SnapshotResult<PathBuf> {
        if self.frozen {
            let cache = self.path_cache.lock().map_err(|_| SnapshotError::Poisoned)?;
            if let Some(path) = cache.get(&(id.clone(), kind)) {
                return Ok(path.clone());
            }
        }

        let mut names = Vec::new();
        let mut current = self.require(id)?;
        loop {
            let entry = self
                .resolve(current)
                .ok_or_else(|| SnapshotError::NotFound(id.clone()))?;
            let Some(parent) = entry.parent else {
                break;
            };
            let name = match kind {
                PathKind::Raw => entry.item.name(),
                PathKind::Normalized => entry.item.normalized_name().as_str(),
            };
            if is_illegal_component(name) {
                return Err(SnapshotError::IgnoredPath {
                    id: id.clone(),
                    component: name.to_string(),
                });
            }
            names.push(name);
            if names.len() > self.index.len() {
                return Err(SnapshotError::Integrity(format!("parent chain of {id} loops")));
            }
            current = parent;
        }

        let path: PathBuf = names.into_iter().rev().collect();
        if self.frozen {
            let mut cache = self.path_cache.lock().map_err(|_| SnapshotError::Poisoned)?;
            cache.insert((id.clone(), kind), path.clone());
        }
        Ok(path)
    }

    // ── Integrity ────────────────────────────────────────────────

    /// Verifies that every child points back to its parent and that every
    /// indexed item is reachable from the root.
    pub fn check_integrity_recursively(&self) -> SnapshotResult<()> {
        let root = self.require(&self.root_id)?;
        let mut reached = 1usize;
        let mut stack = vec![root];
        while let Some(handle) = stack.pop() {
            let entry = self
                .resolve(handle)
                .ok_or_else(|| SnapshotError::Integrity("dangling handle".into()))?;
            for child in &entry.children {
                let child_entry = self.resolve(*child).ok_or_else(|| {
                    SnapshotError::Integrity(format!("{} has a dangling child", entry.item.id))
                })?;
                if child_entry.parent != Some(handle)
                    || child_entry.item.parent_id.as_ref() != Some(&entry.item.id)
                {
                    return Err(SnapshotError::Integrity(format!(
                        "{} does not point back to {}",
                        child_entry.item.id, entry.item.id
                    )));
                }
                reached += 1;
                stack.push(*child);
            }
        }
        if reached != self.index.len() {
            return Err(SnapshotError::Integrity(format!(
                "{} of {} items reachable from the root",
                reached,
                self.index.len()
            )));
        }
        Ok(())
    }

    /// Read-only copy that may cache paths.
    pub fn frozen_copy(&self) -> Snapshot {
        Snapshot {
            side: self.side,
            root_id: self.root_id.clone(),
            slots: self.slots.clone(),
            free: self.free.clone(),
            index: self.index.clone(),
            revision: self.revision,
            frozen: true,
            path_cache: Mutex::new(HashMap::new()),
        }
    }

    // ── Arena internals ──────────────────────────────────────────

    fn ensure_mutable(&self) -> SnapshotResult<()> {
        if self.frozen {
            Err(SnapshotError::Frozen)
        } else {
            Ok(())
        }
    }

    fn handle(&self, id: &NodeId) -> Option<Handle> {
        self.index.get(id).copied()
    }

    fn require(&self, id: &NodeId) -> SnapshotResult<Handle> {
        self.handle(id)
            .ok_or_else(|| SnapshotError::NotFound(id.clone()))
    }

    fn entry(&self, id: &NodeId) -> Option<&Entry> {
        self.handle(id).and_then(|h| self.resolve(h))
    }

    fn resolve(&self, handle: Handle) -> Option<&Entry> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn resolve_mut(&mut self, handle: Handle) -> Option<&mut Entry> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    fn alloc(&mut self, entry: Entry) -> Handle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            Handle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            Handle {
                index,
                generation: 0,
            }
        }
    }

    /// Frees a slot. The entry must no longer be linked from anywhere.
    fn release(&mut self, handle: Handle) -> SnapshotResult<SnapshotItem> {
        let linked_from_parent = self
            .resolve(handle)
            .and_then(|e| e.parent)
            .and_then(|p| self.resolve(p))
            .is_some_and(|p| p.children.contains(&handle));
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or_else(|| SnapshotError::Integrity("releasing a stale handle".into()))?;
        let still_referenced = linked_from_parent
            || slot.entry.as_ref().is_some_and(|e| !e.children.is_empty());
        if still_referenced {
            return Err(SnapshotError::Integrity(
                "releasing an item that is still linked".into(),
            ));
        }
        let entry = slot
            .entry
            .take()
            .ok_or_else(|| SnapshotError::Integrity("releasing an empty slot".into()))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(entry.item)
    }
}

/// Components that must never reach the filesystem.
fn is_illegal_component(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." {
        return true;
    }
    if name.contains('\0') || name.contains('/') {
        return true;
    }
    let bytes = name.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
