//! Persisted node map for twinsync.
//!
//! Each logical item that has been synced at least once has one row here,
//! mapping its local identifier and its remote identifier to an internal
//! [`DbNodeId`](twinsync_types::DbNodeId) together with the attributes both
//! replicas had when they last agreed.
//!
//! # Architecture
//!
//! - [`NodeStore`] owns the SQLite connection. Every mutating write bumps an
//!   in-memory revision counter.
//! - [`NodeCache`] is a read-through cache rebuilt wholesale whenever the
//!   store revision differs from the one it loaded.
//! - [`SchemaVersion`] drives upgrades of older database files one step at a
//!   time.

mod cache;
mod error;
mod node;
mod schema;
mod store;

pub use cache::NodeCache;
pub use error::{StoreError, StoreResult};
pub use node::{PersistedNode, SyncStatus};
pub use schema::{upgrade, SchemaVersion};
pub use store::NodeStore;
