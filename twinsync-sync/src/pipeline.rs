//! One sync cycle, end to end.
//!
//! # Architecture
//!
//! ```text
//! LiveSnapshot (local) ──┐
//!                        ├─ copy ─ ChangeDetector ×2 ─ ConflictFinder
//! LiveSnapshot (remote) ─┘                                 │
//!                                ConflictResolver ─────────┘
//!                                       │
//!                                   Executor ─ NodeStore
//! ```
//!
//! The pipeline owns the copy trackers, so a cycle works on frozen copies
//! while the observers keep updating the live trees.

use crate::conflict::ConflictFinder;
use crate::context::SyncContext;
use crate::detector::ChangeDetector;
use crate::error::{SyncError, SyncResult};
use crate::executor::{ExecutionReport, ExitCause, Executor};
use crate::resolver::ConflictResolver;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{error, info};
use twinsync_snapshot::{CopyTracker, LiveSnapshot, Snapshot};
use twinsync_types::ReplicaSide;

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub local_ops: usize,
    pub remote_ops: usize,
    pub conflicts: usize,
    /// Another cycle should run right away.
    pub needs_restart: bool,
    pub execution: ExecutionReport,
}

impl CycleReport {
    /// Nothing was detected on either side.
    pub fn is_idle(&self) -> bool {
        self.local_ops == 0 && self.remote_ops == 0
    }
}

pub struct SyncPipeline {
    ctx: Arc<SyncContext>,
    local_copy: CopyTracker,
    remote_copy: CopyTracker,
    stop: Arc<AtomicBool>,
}

impl SyncPipeline {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            local_copy: CopyTracker::new(),
            remote_copy: CopyTracker::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// Flag that cancels a running execution once set.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Takes fresh copies of both live trees (if they moved) and runs a
    /// cycle on them.
    pub async fn run_cycle(
        &mut self,
        local: &LiveSnapshot,
        remote: &LiveSnapshot,
    ) -> SyncResult<CycleReport> {
        let (local_copy, _) = self.local_copy.refresh(local)?;
        let (remote_copy, _) = self.remote_copy.refresh(remote)?;
        self.run_cycle_with(&local_copy, &remote_copy).await
    }

    /// Runs a cycle on the given snapshots.
    pub async fn run_cycle_with(
        &self,
        local: &Snapshot,
        remote: &Snapshot,
    ) -> SyncResult<CycleReport> {
        if local.side() != ReplicaSide::Local || remote.side() != ReplicaSide::Remote {
            return Err(SyncError::Inconsistency(format!(
                "snapshots given as ({}, {})",
                local.side(),
                remote.side()
            )));
        }
        let ctx = &self.ctx;
        ctx.cache.reload_if_needed()?;
        let purged = ctx.blacklist.purge_expired();
        if purged > 0 {
            info!(purged, "expired blacklist entries dropped");
        }

        let detector = ChangeDetector::new(
            &ctx.cache,
            &ctx.exclusions,
            &ctx.blacklist,
            &ctx.config.rescue_folder_name,
        )
        .with_events(ctx.events.as_ref());
        let local_ops = detector.detect(local)?;
        let remote_ops = detector.detect(remote)?;

        let conflicts =
            ConflictFinder::new(&ctx.cache, &local_ops, &remote_ops, local, remote).find()?;
        let resolution = ConflictResolver::new(
            &ctx.cache,
            &ctx.config,
            ctx.events.as_ref(),
            (local, remote),
            (&local_ops, &remote_ops),
        )
        .resolve(&conflicts)?;
        let needs_restart = resolution.needs_restart;

        let execution = Executor::new(ctx)
            .with_stop_flag(Arc::clone(&self.stop))
            .execute(resolution.ops, local, remote)
            .await?;
        if let ExitCause::Fatal(err) = &execution.exit_cause {
            error!(error = %err, "cycle stopped on a fatal error");
        }

        let report = CycleReport {
            local_ops: local_ops.len(),
            remote_ops: remote_ops.len(),
            conflicts: conflicts.len(),
            needs_restart,
            execution,
        };
        info!(
            local_ops = report.local_ops,
            remote_ops = report.remote_ops,
            conflicts = report.conflicts,
            succeeded = report.execution.succeeded,
            failed = report.execution.failed,
            "sync cycle finished"
        );
        Ok(report)
    }
}
