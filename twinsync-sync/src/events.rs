//! User-facing sync events.
//!
//! Conflicts, rescues and per-item failures are reported here so a host can
//! show them. The core never decides how they are presented.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};
use twinsync_types::{ConflictType, NodeId, ReplicaSide};

/// Why an event was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventCause {
    /// A conflict was detected and resolved.
    Conflict,
    /// Content was moved or downloaded into the rescue folder.
    Rescued,
    /// The item is excluded until its blacklist entry expires.
    TmpBlacklisted,
    /// An operation failed and was not retried this cycle.
    OperationFailed,
    /// A remote move lost against a local delete; nothing needed rescuing.
    RemoteChangeDiscarded,
    /// The item matched an exclusion rule.
    Excluded,
}

/// One structured entry for the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub side: Option<ReplicaSide>,
    pub node_id: Option<NodeId>,
    pub path: PathBuf,
    pub dest_path: Option<PathBuf>,
    pub conflict: Option<ConflictType>,
    pub cause: EventCause,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl SyncEvent {
    pub fn new(cause: EventCause, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            side: None,
            node_id: None,
            path: path.into(),
            dest_path: None,
            conflict: None,
            cause,
            message: message.into(),
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn on(mut self, side: ReplicaSide, node_id: NodeId) -> Self {
        self.side = Some(side);
        self.node_id = Some(node_id);
        self
    }

    #[must_use]
    pub fn with_dest(mut self, dest: impl Into<PathBuf>) -> Self {
        self.dest_path = Some(dest.into());
        self
    }

    #[must_use]
    pub fn with_conflict(mut self, conflict: ConflictType) -> Self {
        self.conflict = Some(conflict);
        self
    }
}

/// Receives events raised during a cycle.
pub trait ErrorSink: Send + Sync {
    fn report(&self, event: SyncEvent);
}

/// Writes events to the log.
#[derive(Debug, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, event: SyncEvent) {
        match event.cause {
            EventCause::OperationFailed | EventCause::TmpBlacklisted => warn!(
                cause = ?event.cause,
                path = %event.path.display(),
                side = ?event.side,
                "{}",
                event.message
            ),
            _ => info!(
                cause = ?event.cause,
                path = %event.path.display(),
                conflict = ?event.conflict,
                "{}",
                event.message
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryErrorSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl MemoryErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, cause: EventCause) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| ev.cause == cause).count())
            .unwrap_or(0)
    }
}

impl ErrorSink for MemoryErrorSink {
    fn report(&self, event: SyncEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
