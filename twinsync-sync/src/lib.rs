//! Two-way sync core for twinsync.
//!
//! Keeps a local directory tree and a remote drive in agreement, using the
//! persisted node map of `twinsync-store` as the common ancestor of both.
//!
//! # Architecture
//!
//! A sync cycle runs five stages on frozen copies of both replica trees:
//!
//! 1. **Detect**: [`ChangeDetector`] diffs each snapshot against the node
//!    map and emits Create, Delete, Move and Edit operations.
//! 2. **Find conflicts**: [`ConflictFinder`] pairs incompatible local and
//!    remote operations and classifies them ([`ConflictType`]).
//! 3. **Resolve**: [`ConflictResolver`] handles conflicts in priority order
//!    and plans everything else into one dependency-annotated
//!    [`SyncOperationList`].
//! 4. **Execute**: [`Executor`] runs the list through the [`RemoteDrive`],
//!    the local disk and the [`Vfs`], then records each success in the
//!    store.
//! 5. **Rescue**: local content that would otherwise be lost is moved aside
//!    by the [`FileRescuer`].
//!
//! [`SyncPipeline`] chains the stages; [`SyncWorker`] repeats cycles until
//! told to stop.
//!
//! ## Collaborators
//!
//! The remote drive, the platform VFS and the host's error display are
//! traits. `mock` modules provide in-memory versions for tests.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use twinsync_store::NodeStore;
//! use twinsync_sync::remote::mock::MockRemote;
//! use twinsync_sync::{MemoryErrorSink, NoopVfs, SyncConfig, SyncContext, SyncPipeline};
//! use twinsync_types::NodeId;
//!
//! let store = NodeStore::open_in_memory(&NodeId::new("local-root"), &NodeId::new("r0")).unwrap();
//! let ctx = SyncContext::new(
//!     SyncConfig::for_root("/tmp/twinsync-demo"),
//!     Arc::new(store),
//!     Arc::new(MockRemote::new("r0")),
//!     Arc::new(NoopVfs),
//!     Arc::new(MemoryErrorSink::new()),
//! )
//! .unwrap();
//! let pipeline = SyncPipeline::new(Arc::new(ctx));
//! assert!(!pipeline.context().uses_placeholders());
//! ```

pub mod config;
pub mod conflict;
pub mod context;
pub mod detector;
mod error;
pub mod events;
pub mod exclusion;
pub mod executor;
pub mod jobs;
pub mod local_scan;
pub mod naming;
pub mod operation;
pub mod pipeline;
pub mod remote;
pub mod rescuer;
pub mod resolver;
pub mod vfs;
pub mod worker;

pub use config::{ExclusionConfig, SyncConfig};
pub use conflict::{Conflict, ConflictFinder, ConflictNode, Relation, classify};
pub use context::SyncContext;
pub use detector::{ChangeDetector, FsOperation, FsOperationSet};
pub use error::{Disposition, JobError, SyncError, SyncResult};
pub use events::{ErrorSink, EventCause, MemoryErrorSink, SyncEvent, TracingErrorSink};
pub use exclusion::{Exclusion, ExclusionRules, TmpBlacklist};
pub use executor::{ExecutionReport, Executor, ExitCause, TerminatedJobs, remove_dependent_ops};
pub use jobs::{Job, JobId, JobOutput};
pub use local_scan::{local_node_id, scan_local};
pub use operation::{NodeRef, OpId, SyncOperation, SyncOperationList};
pub use pipeline::{CycleReport, SyncPipeline};
pub use remote::{NetError, NetResult, RemoteDrive, RemoteItem, RetryPolicy, with_retry};
pub use rescuer::FileRescuer;
pub use resolver::{ConflictResolver, Resolution, link_dependencies};
pub use vfs::{NoopVfs, PinState, PlaceholderInfo, Vfs, VfsStatus};
pub use worker::{SyncWorker, WorkerCommand, WorkerHandle, WorkerState};

pub use twinsync_types::{ConflictType, OperationType, ReplicaSide};
