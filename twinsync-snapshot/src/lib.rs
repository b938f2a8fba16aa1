//! In-memory replica trees.
//!
//! A [`Snapshot`] mirrors the current state of one replica (local disk or
//! remote drive). An external observer mutates a [`LiveSnapshot`]; each sync
//! cycle works on a frozen copy taken under the lock.
//!
//! # Architecture
//!
//! Items live in an arena of slots. Parent and child links are generational
//! handles into that arena, so removing a subtree invalidates every handle
//! that pointed into it without reference counting. The identifier index maps
//! a replica's [`NodeId`](twinsync_types::NodeId) to its current handle.
//!
//! Consumers decide whether a fresh copy is needed by comparing revisions
//! (see [`CopyTracker`]); nothing else is used for change detection at this
//! level.

mod error;
mod item;
mod live;
mod snapshot;

pub use error::{SnapshotError, SnapshotResult};
pub use item::SnapshotItem;
pub use live::{CopyTracker, LiveSnapshot};
pub use snapshot::Snapshot;
