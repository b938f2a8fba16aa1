//! Shared live snapshot and per-consumer copy tracking.

use crate::error::{SnapshotError, SnapshotResult};
use crate::item::SnapshotItem;
use crate::snapshot::Snapshot;
use std::sync::{Arc, RwLock};
use twinsync_types::{NodeId, ReplicaSide};

/// The snapshot an observer keeps up to date.
///
/// Mutations take the write lock; [`copy`](Self::copy) takes the read lock
/// once and clones the arena, so path reconstruction never happens under
/// this lock.
#[derive(Debug)]
pub struct LiveSnapshot {
    inner: RwLock<Snapshot>,
}

impl LiveSnapshot {
    pub fn new(side: ReplicaSide, root_id: impl Into<NodeId>) -> Self {
        Self {
            inner: RwLock::new(Snapshot::new(side, root_id)),
        }
    }

    /// Wraps an existing (non-frozen) snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> SnapshotResult<Self> {
        if snapshot.is_frozen() {
            return Err(SnapshotError::Frozen);
        }
        Ok(Self {
            inner: RwLock::new(snapshot),
        })
    }

    pub fn update_item(&self, item: SnapshotItem) -> SnapshotResult<()> {
        self.inner
            .write()
            .map_err(|_| SnapshotError::Poisoned)?
            .update_item(item)
    }

    pub fn remove_item(&self, id: &NodeId) -> SnapshotResult<()> {
        self.inner
            .write()
            .map_err(|_| SnapshotError::Poisoned)?
            .remove_item(id)
    }

    /// Swaps in a freshly scanned tree. The revision keeps increasing so
    /// consumers holding an older copy notice the change.
    pub fn replace(&self, mut snapshot: Snapshot) -> SnapshotResult<()> {
        if snapshot.is_frozen() {
            return Err(SnapshotError::Frozen);
        }
        let mut guard = self.inner.write().map_err(|_| SnapshotError::Poisoned)?;
        let next = guard.revision().max(snapshot.revision()) + 1;
        snapshot.set_revision(next);
        *guard = snapshot;
        Ok(())
    }

    pub fn revision(&self) -> SnapshotResult<u64> {
        Ok(self
            .inner
            .read()
            .map_err(|_| SnapshotError::Poisoned)?
            .revision())
    }

    /// Point-in-time frozen copy.
    pub fn copy(&self) -> SnapshotResult<Snapshot> {
        Ok(self
            .inner
            .read()
            .map_err(|_| SnapshotError::Poisoned)?
            .frozen_copy())
    }

    /// Runs `f` against the live tree under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> SnapshotResult<R> {
        let guard = self.inner.read().map_err(|_| SnapshotError::Poisoned)?;
        Ok(f(&guard))
    }
}

/// Keeps the last copy a consumer took and refreshes it only when the live
/// revision moved.
#[derive(Debug, Default)]
pub struct CopyTracker {
    copy: Option<Arc<Snapshot>>,
}

impl CopyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current copy and whether it was refreshed.
    pub fn refresh(&mut self, live: &LiveSnapshot) -> SnapshotResult<(Arc<Snapshot>, bool)> {
        let live_revision = live.revision()?;
        if let Some(copy) = &self.copy {
            if copy.revision() == live_revision {
                return Ok((Arc::clone(copy), false));
            }
        }
        let copy = Arc::new(live.copy()?);
        self.copy = Some(Arc::clone(&copy));
        Ok((copy, true))
    }

    pub fn cached_revision(&self) -> Option<u64> {
        self.copy.as_ref().map(|c| c.revision())
    }

    /// Forces the next [`refresh`](Self::refresh) to take a new copy.
    pub fn invalidate(&mut self) {
        self.copy = None;
    }
}
