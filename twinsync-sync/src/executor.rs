//! Executes a planned operation list against both replicas.
//!
//! # Architecture
//!
//! A single control loop owns the queue. Every pass it dispatches the
//! operations whose dependencies are all finished, up to
//! `max_parallel_jobs` transfers in flight. Short jobs (directory creation,
//! moves, rescues, store-only updates) run on the loop itself; transfers run
//! on their own task and report back through [`TerminatedJobs`].
//!
//! The store is written only after a job succeeds, from the loop, so
//! commits never race. A failed job is classified by
//! [`JobError::disposition`] and its dependents are cancelled through
//! [`remove_dependent_ops`].

use crate::context::SyncContext;
use crate::error::{Disposition, JobError, SyncResult};
use crate::events::{EventCause, SyncEvent};
use crate::jobs::{Job, JobEnv, JobId, JobOutput, JobResult, local_state};
use crate::operation::{OpId, SyncOperation, SyncOperationList};
use crate::vfs::PlaceholderInfo;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use twinsync_snapshot::{Snapshot, SnapshotItem};
use twinsync_store::{PersistedNode, StoreError, StoreResult};
use twinsync_types::{DbNodeId, NodeId, OperationType, ReplicaSide, SyncName};

/// How often a waiting loop looks at the stop flag.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why [`Executor::execute`] returned.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExitCause {
    #[default]
    Completed,
    /// The stop flag was raised.
    Cancelled,
    /// A job failed in a way that stops the cycle.
    Fatal(JobError),
}

/// Outcome of one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Dropped without running: dependents of failures, or left over on
    /// cancel.
    pub cancelled: usize,
    pub exit_cause: ExitCause,
}

impl ExecutionReport {
    pub fn is_complete(&self) -> bool {
        self.exit_cause == ExitCause::Completed
    }
}

// ── Job bookkeeping ──────────────────────────────────────────────

/// Results of spawned jobs, in completion order.
#[derive(Default)]
pub struct TerminatedJobs {
    queue: Mutex<VecDeque<(JobId, JobResult)>>,
    notify: Notify,
}

impl TerminatedJobs {
    pub fn push(&self, id: JobId, result: JobResult) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back((id, result));
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<(JobId, JobResult)> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Waits until something was pushed since the last wait.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Abort handles of running jobs. Dropping the set aborts them all.
#[derive(Default)]
struct JobSet {
    handles: HashMap<JobId, AbortHandle>,
}

impl JobSet {
    fn insert(&mut self, id: JobId, handle: AbortHandle) {
        self.handles.insert(id, handle);
    }

    fn remove(&mut self, id: JobId) {
        self.handles.remove(&id);
    }

    fn abort_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }
}

impl Drop for JobSet {
    fn drop(&mut self) {
        self.abort_all();
    }
}

struct Ongoing {
    op: SyncOperation,
    job: Job,
}

/// Mutable state of one [`Executor::execute`] call.
#[derive(Default)]
struct Run {
    queue: SyncOperationList,
    ongoing: HashMap<JobId, Ongoing>,
    jobs: JobSet,
    retried: HashSet<OpId>,
    report: ExecutionReport,
}

impl Run {
    fn is_pending(&self, id: OpId) -> bool {
        self.queue.get(id).is_some() || self.ongoing.values().any(|o| o.op.id == id)
    }

    fn is_ready(&self, op: &SyncOperation) -> bool {
        op.depends_on.iter().all(|dep| !self.is_pending(*dep))
    }

    fn cancel_everything(&mut self) {
        self.jobs.abort_all();
        self.report.cancelled += self.queue.len() + self.ongoing.len();
        self.queue = SyncOperationList::new();
        self.ongoing.clear();
    }
}

#[derive(Clone, Copy)]
struct Replicas<'s> {
    local: &'s Snapshot,
    remote: &'s Snapshot,
}

impl<'s> Replicas<'s> {
    fn get(&self, side: ReplicaSide) -> &'s Snapshot {
        match side {
            ReplicaSide::Local => self.local,
            ReplicaSide::Remote => self.remote,
        }
    }
}

// ── Executor ─────────────────────────────────────────────────────

pub struct Executor<'a> {
    ctx: &'a SyncContext,
    env: Arc<JobEnv>,
    stop: Option<Arc<AtomicBool>>,
}

impl<'a> Executor<'a> {
    pub fn new(ctx: &'a SyncContext) -> Self {
        let env = Arc::new(JobEnv {
            remote: Arc::clone(&ctx.remote),
            vfs: Arc::clone(&ctx.vfs),
            rescuer: Arc::clone(&ctx.rescuer),
            retry: ctx.retry_policy(),
            placeholders: ctx.uses_placeholders(),
        });
        Self {
            ctx,
            env,
            stop: None,
        }
    }

    /// Checks `stop` between jobs and cancels the run once it is set.
    #[must_use]
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().is_some_and(|s| s.load(Ordering::SeqCst))
    }

    /// Runs every operation of `ops`. Store failures abort with an error;
    /// everything else ends up in the report.
    pub async fn execute(
        &self,
        ops: SyncOperationList,
        local: &Snapshot,
        remote: &Snapshot,
    ) -> SyncResult<ExecutionReport> {
        let replicas = Replicas { local, remote };
        let terminated = Arc::new(TerminatedJobs::default());
        let mut run = Run {
            queue: ops,
            ..Run::default()
        };
        info!(ops = run.queue.len(), "executing sync operations");

        loop {
            if self.stop_requested() {
                info!(
                    pending = run.queue.len(),
                    running = run.ongoing.len(),
                    "stop requested, cancelling"
                );
                run.cancel_everything();
                run.report.exit_cause = ExitCause::Cancelled;
                break;
            }

            let mut ready: Vec<OpId> = run
                .queue
                .iter()
                .filter(|op| run.is_ready(op))
                .map(|op| op.id)
                .collect();
            if ready.is_empty() && run.ongoing.is_empty() {
                let Some(first) = run.queue.iter().next().map(|op| op.id) else {
                    break;
                };
                warn!(op = %first, "no operation is ready, forcing the first one");
                ready.push(first);
            }

            for id in ready {
                if run.ongoing.len() >= self.ctx.config.max_parallel_jobs {
                    break;
                }
                let Some(op) = run.queue.remove(id) else {
                    continue;
                };
                self.dispatch(op, replicas, &terminated, &mut run).await?;
                if run.report.exit_cause != ExitCause::Completed {
                    break;
                }
            }
            if run.report.exit_cause != ExitCause::Completed {
                break;
            }

            if run.ongoing.is_empty() {
                continue;
            }
            let mut finished = 0;
            while let Some((job_id, result)) = terminated.pop() {
                finished += 1;
                run.jobs.remove(job_id);
                let Some(Ongoing { op, job }) = run.ongoing.remove(&job_id) else {
                    debug!(job = %job_id, "result for an unknown job");
                    continue;
                };
                self.finish(op, job, result, replicas, &mut run).await?;
                if run.report.exit_cause != ExitCause::Completed {
                    break;
                }
            }
            if run.report.exit_cause != ExitCause::Completed {
                break;
            }
            if finished == 0 {
                tokio::select! {
                    () = terminated.wait() => {}
                    () = tokio::time::sleep(STOP_POLL_INTERVAL) => {}
                }
            }
        }

        info!(
            succeeded = run.report.succeeded,
            failed = run.report.failed,
            cancelled = run.report.cancelled,
            exit = ?run.report.exit_cause,
            "execution finished"
        );
        Ok(std::mem::take(&mut run.report))
    }

    async fn dispatch(
        &self,
        op: SyncOperation,
        replicas: Replicas<'_>,
        terminated: &Arc<TerminatedJobs>,
        run: &mut Run,
    ) -> SyncResult<()> {
        let job = match self.prepare(&op, replicas).await {
            Ok(job) => job,
            Err(err) => {
                // Nothing ran; classify as if the job had failed.
                return self.finish(op, Job::StoreOnly, Err(err), replicas, run).await;
            }
        };
        debug!(op = %op, job = job.name(), "dispatching");

        if job.is_inline() {
            let result = job.clone().run(Arc::clone(&self.env)).await;
            return self.finish(op, job, result, replicas, run).await;
        }

        let job_id = JobId::new();
        let inner = tokio::spawn(job.clone().run(Arc::clone(&self.env)));
        run.jobs.insert(job_id, inner.abort_handle());
        let sink = Arc::clone(terminated);
        tokio::spawn(async move {
            let result = match inner.await {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Err(JobError::Cancelled),
                Err(err) => Err(JobError::Io(format!("job panicked: {err}"))),
            };
            sink.push(job_id, result);
        });
        run.ongoing.insert(job_id, Ongoing { op, job });
        Ok(())
    }

    // ── Completion ───────────────────────────────────────────────

    async fn finish(
        &self,
        op: SyncOperation,
        job: Job,
        result: JobResult,
        replicas: Replicas<'_>,
        run: &mut Run,
    ) -> SyncResult<()> {
        let err = match result {
            Ok(output) => {
                self.commit(&op, &output, replicas)?;
                run.report.succeeded += 1;
                return Ok(());
            }
            Err(err) => err,
        };

        match err.disposition() {
            Disposition::AlreadyDone => {
                debug!(op = %op, error = %err, "target already up to date");
                if op.op_type == OperationType::Delete {
                    self.commit(&op, &JobOutput::Unchanged, replicas)?;
                }
                run.report.succeeded += 1;
            }
            Disposition::Retry if !run.retried.contains(&op.id) => {
                info!(op = %op, error = %err, "operation will be retried");
                run.retried.insert(op.id);
                run.queue.requeue(op);
            }
            Disposition::Reconcile => match self.reconcile(&op, &job).await {
                Some(output) => {
                    info!(op = %op, "target already exists, linked to it");
                    self.commit(&op, &output, replicas)?;
                    run.report.succeeded += 1;
                }
                None => self.blacklist(&op, &err, replicas, run),
            },
            Disposition::Blacklist | Disposition::Retry => self.blacklist(&op, &err, replicas, run),
            Disposition::OperationFailed => {
                warn!(op = %op, error = %err, "operation failed");
                let side = op.source_side();
                self.ctx
                    .blacklist
                    .increase_error_count(side, &op.affected.id, &op.affected.path);
                self.ctx.events.report(
                    SyncEvent::new(EventCause::OperationFailed, &op.affected.path, err.to_string())
                        .on(side, op.affected.id.clone()),
                );
                run.report.failed += 1;
                self.cancel_dependents(&op, replicas, run);
            }
            Disposition::Fatal => {
                error!(op = %op, error = %err, "fatal error, stopping the cycle");
                run.report.failed += 1;
                run.cancel_everything();
                run.report.exit_cause = ExitCause::Fatal(err);
            }
        }
        Ok(())
    }

    fn blacklist(&self, op: &SyncOperation, err: &JobError, replicas: Replicas<'_>, run: &mut Run) {
        warn!(op = %op, error = %err, "operation failed, blacklisting the item");
        let side = op.source_side();
        self.ctx
            .blacklist
            .blacklist_item(side, &op.affected.id, &op.affected.path);
        self.ctx.events.report(
            SyncEvent::new(EventCause::TmpBlacklisted, &op.affected.path, err.to_string())
                .on(side, op.affected.id.clone()),
        );
        run.report.failed += 1;
        self.cancel_dependents(op, replicas, run);
    }

    fn cancel_dependents(&self, op: &SyncOperation, replicas: Replicas<'_>, run: &mut Run) {
        let removed = remove_dependent_ops(&mut run.queue, op, replicas.local, replicas.remote);
        if !removed.is_empty() {
            debug!(op = %op, cancelled = removed.len(), "dependent operations cancelled");
        }
        run.report.cancelled += removed.len();
    }

    /// An item is in the way of a directory Create: if it is a directory
    /// too, link to it.
    async fn reconcile(&self, op: &SyncOperation, job: &Job) -> Option<JobOutput> {
        if op.op_type != OperationType::Create || !op.is_dir() {
            return None;
        }
        match job {
            Job::CreateRemoteDir { parent, name, .. } => {
                let existing = self.ctx.remote.find_child(parent, name).await.ok()??;
                existing
                    .node_type
                    .is_dir()
                    .then_some(JobOutput::Remote(existing))
            }
            Job::CreateLocalDir { path, .. } => {
                let metadata = tokio::fs::symlink_metadata(path).await.ok()?;
                if !metadata.is_dir() {
                    return None;
                }
                local_state(path).await.ok().map(JobOutput::Local)
            }
            _ => None,
        }
    }

    // ── Job preparation ──────────────────────────────────────────

    fn local_root(&self) -> &Path {
        &self.ctx.config.local_root
    }

    async fn prepare(&self, op: &SyncOperation, replicas: Replicas<'_>) -> Result<Job, JobError> {
        if op.omit {
            return Ok(Job::StoreOnly);
        }
        if op.is_rescue && op.affected.side == ReplicaSide::Remote {
            return Ok(Job::RescueRemote {
                remote_id: op.affected.id.clone(),
                rel_path: snapshot_path(replicas.remote, &op.affected.id)?,
            });
        }
        if op.is_rescue {
            let rel_path = snapshot_path(replicas.local, &op.affected.id)?;
            return Ok(Job::Rescue {
                rel_path,
                node_id: op.affected.id.clone(),
            });
        }
        if op.is_in_place() {
            return self.prepare_in_place(op, replicas);
        }

        let source = replicas.get(op.source_side());
        match (op.op_type, op.target_side) {
            (OperationType::Create, ReplicaSide::Local) => {
                let item = source_item(source, &op.affected.id)?;
                let parent_db = self.required_parent_db(source, &op.affected.id)?;
                let dest = self
                    .local_root()
                    .join(self.local_db_path(parent_db, replicas.local)?)
                    .join(item.normalized_name().as_str());
                if item.is_dir() {
                    Ok(Job::CreateLocalDir {
                        path: dest,
                        remote_id: op.affected.id.clone(),
                    })
                } else if self.ctx.uses_placeholders() {
                    Ok(Job::CreatePlaceholder {
                        dest,
                        remote_id: op.affected.id.clone(),
                        info: placeholder_info(item),
                    })
                } else {
                    Ok(Job::Download {
                        remote_id: op.affected.id.clone(),
                        dest,
                        create: true,
                    })
                }
            }
            (OperationType::Create, ReplicaSide::Remote) => {
                let item = source_item(source, &op.affected.id)?;
                let parent_db = self.required_parent_db(source, &op.affected.id)?;
                let parent = self.counterpart(parent_db, ReplicaSide::Remote)?;
                let name = item.normalized_name().clone();
                let source_path = self.local_root().join(snapshot_path(source, &op.affected.id)?);
                if item.is_dir() {
                    return Ok(Job::CreateRemoteDir {
                        parent,
                        name,
                        source: source_path,
                    });
                }
                if self.is_protected_remote_dir(parent_db)? {
                    return Err(JobError::Forbidden(format!(
                        "files cannot be created in {}",
                        op.affected.path.parent().unwrap_or(Path::new("")).display()
                    )));
                }
                if self.ctx.uses_placeholders() {
                    let status = self.ctx.vfs.status(&source_path).await?;
                    if status.is_dehydrated() && !status.is_syncing {
                        // Its content is not on disk; there is nothing to upload.
                        return Err(JobError::DehydratedPlaceholder(
                            op.affected.path.display().to_string(),
                        ));
                    }
                }
                Ok(Job::Upload {
                    parent,
                    name,
                    source: source_path,
                })
            }
            (OperationType::Edit, ReplicaSide::Remote) => {
                let db_id = required_db_id(op)?;
                let path = self.local_root().join(snapshot_path(source, &op.affected.id)?);
                if self.ctx.uses_placeholders()
                    && self.ctx.vfs.status(&path).await?.is_dehydrated()
                {
                    // Only the placeholder's date moved; there is no content
                    // to upload.
                    let persisted = self.required_node(db_id)?;
                    if let Some(mtime) = persisted.last_modified_local {
                        return Ok(Job::RestoreMtime { path, mtime });
                    }
                }
                Ok(Job::UploadReplace {
                    remote_id: self.target_id(op, db_id)?,
                    source: path,
                })
            }
            (OperationType::Edit, ReplicaSide::Local) => {
                let item = source_item(source, &op.affected.id)?;
                let db_id = required_db_id(op)?;
                let path = self.local_target_path(op, db_id, replicas.local)?;
                if self.ctx.uses_placeholders()
                    && self.ctx.vfs.status(&path).await?.is_dehydrated()
                {
                    return Ok(Job::UpdatePlaceholder {
                        path,
                        info: placeholder_info(item),
                    });
                }
                Ok(Job::Download {
                    remote_id: op.affected.id.clone(),
                    dest: path,
                    create: false,
                })
            }
            (OperationType::Move, ReplicaSide::Local) => {
                let item = source_item(source, &op.affected.id)?;
                let db_id = required_db_id(op)?;
                let from = self.local_target_path(op, db_id, replicas.local)?;
                let parent_db = self.required_parent_db(source, &op.affected.id)?;
                let to = self
                    .local_root()
                    .join(self.local_db_path(parent_db, replicas.local)?)
                    .join(item.normalized_name().as_str());
                Ok(Job::MoveLocal { from, to })
            }
            (OperationType::Move, ReplicaSide::Remote) => {
                let item = source_item(source, &op.affected.id)?;
                let db_id = required_db_id(op)?;
                let parent_db = self.required_parent_db(source, &op.affected.id)?;
                Ok(Job::MoveRemote {
                    remote_id: self.target_id(op, db_id)?,
                    parent: self.counterpart(parent_db, ReplicaSide::Remote)?,
                    name: item.normalized_name().clone(),
                })
            }
            (OperationType::Delete, ReplicaSide::Local) => {
                let db_id = required_db_id(op)?;
                Ok(Job::DeleteLocal {
                    path: self.local_target_path(op, db_id, replicas.local)?,
                })
            }
            (OperationType::Delete, ReplicaSide::Remote) => {
                let db_id = required_db_id(op)?;
                Ok(Job::DeleteRemote {
                    remote_id: self.target_id(op, db_id)?,
                })
            }
            (other, _) => Err(JobError::Inconsistency(format!(
                "{other} operations are not executed"
            ))),
        }
    }

    /// Conflict renames and undo moves act on the item where it is.
    fn prepare_in_place(
        &self,
        op: &SyncOperation,
        replicas: Replicas<'_>,
    ) -> Result<Job, JobError> {
        let (Some(parent), Some(name)) = (&op.new_parent, &op.new_name) else {
            return Err(JobError::Inconsistency(format!("{op} has no destination")));
        };
        match op.target_side {
            ReplicaSide::Local => {
                let from = snapshot_path(replicas.local, &op.affected.id)?;
                let to = snapshot_path(replicas.local, parent)?.join(name.as_str());
                Ok(Job::MoveLocal {
                    from: self.local_root().join(from),
                    to: self.local_root().join(to),
                })
            }
            ReplicaSide::Remote => Ok(Job::MoveRemote {
                remote_id: op.affected.id.clone(),
                parent: parent.clone(),
                name: name.clone(),
            }),
        }
    }

    fn required_node(&self, db_id: DbNodeId) -> Result<PersistedNode, JobError> {
        self.ctx
            .cache
            .node(db_id)?
            .ok_or_else(|| JobError::NotFound(format!("node {db_id} is no longer persisted")))
    }

    fn required_parent_db(&self, snapshot: &Snapshot, id: &NodeId) -> Result<DbNodeId, JobError> {
        self.parent_db(snapshot, id)?.ok_or_else(|| {
            JobError::Inconsistency(format!("parent of {id} on {} is not synced", snapshot.side()))
        })
    }

    /// Persisted node of the parent `id` has in `snapshot`.
    fn parent_db(&self, snapshot: &Snapshot, id: &NodeId) -> StoreResult<Option<DbNodeId>> {
        let Some(parent) = snapshot.parent_id(id) else {
            return Ok(None);
        };
        if parent == snapshot.root_id() {
            return self.ctx.cache.root_id();
        }
        self.ctx.cache.db_id(snapshot.side(), parent)
    }

    /// Identifier of a persisted node on `side`.
    fn counterpart(&self, db_id: DbNodeId, side: ReplicaSide) -> Result<NodeId, JobError> {
        self.required_node(db_id)?
            .id(side)
            .cloned()
            .ok_or_else(|| JobError::Inconsistency(format!("node {db_id} has no {side} id")))
    }

    /// Identifier of the item the operation changes on its target side.
    fn target_id(&self, op: &SyncOperation, db_id: DbNodeId) -> Result<NodeId, JobError> {
        match &op.corresponding {
            Some(node) if node.side == op.target_side => Ok(node.id.clone()),
            _ => self.counterpart(db_id, op.target_side),
        }
    }

    /// Absolute path of the local item an operation targets.
    fn local_target_path(
        &self,
        op: &SyncOperation,
        db_id: DbNodeId,
        local: &Snapshot,
    ) -> Result<PathBuf, JobError> {
        let from_snapshot = op
            .corresponding
            .as_ref()
            .filter(|node| node.side == ReplicaSide::Local && local.contains(&node.id))
            .map(|node| snapshot_path(local, &node.id))
            .transpose()?;
        let rel = match from_snapshot {
            Some(path) => path,
            None => self.local_db_path(db_id, local)?,
        };
        Ok(self.local_root().join(rel))
    }

    /// Local path of a persisted node. Uses the on-disk spelling of each
    /// name where the local snapshot still has the item under that name.
    fn local_db_path(&self, db_id: DbNodeId, local: &Snapshot) -> Result<PathBuf, JobError> {
        let max_depth = self.ctx.store.node_count()?;
        let mut names: Vec<String> = Vec::new();
        let mut current = self.required_node(db_id)?;
        while let Some(parent) = current.parent_id {
            let on_disk = current
                .local_id
                .as_ref()
                .and_then(|id| local.item(id))
                .filter(|item| item.normalized_name() == &current.name_local)
                .map(|item| item.name().to_string());
            names.push(on_disk.unwrap_or_else(|| current.name_local.as_str().to_string()));
            if names.len() > max_depth {
                return Err(JobError::Inconsistency(format!("parent chain of {db_id} loops")));
            }
            current = self.required_node(parent)?;
        }
        Ok(names.iter().rev().collect())
    }

    /// Top-level remote folders listed in the config take no files.
    fn is_protected_remote_dir(&self, parent_db: DbNodeId) -> StoreResult<bool> {
        let Some(path) = self.ctx.cache.path(ReplicaSide::Remote, parent_db)? else {
            return Ok(false);
        };
        let mut components = path.components();
        let (Some(first), None) = (components.next(), components.next()) else {
            return Ok(false);
        };
        let name = SyncName::new(&first.as_os_str().to_string_lossy());
        Ok(self
            .ctx
            .config
            .protected_remote_dirs
            .iter()
            .any(|protected| SyncName::new(protected) == name))
    }

    // ── Store updates ────────────────────────────────────────────

    /// Writes the outcome of a successful operation to the store.
    fn commit(
        &self,
        op: &SyncOperation,
        output: &JobOutput,
        replicas: Replicas<'_>,
    ) -> SyncResult<()> {
        if op.skip_db {
            return Ok(());
        }
        if op.is_rescue || op.forget_db {
            if let Some(db_id) = op.db_id {
                forget(self.ctx.store.delete_node(db_id))?;
            }
            return Ok(());
        }
        if op.is_in_place() {
            return Ok(());
        }
        if op.omit {
            return self.commit_store_only(op, replicas);
        }

        let source_side = op.source_side();
        let target_side = op.target_side;
        let source = replicas.get(source_side);
        match op.op_type {
            OperationType::Create => {
                let Some(item) = source.item(&op.affected.id) else {
                    return Ok(());
                };
                let Some(parent_db) = self.parent_db(source, &op.affected.id)? else {
                    warn!(op = %op, "parent vanished before commit");
                    return Ok(());
                };
                let Some(target_id) = output.target_id() else {
                    return Ok(());
                };
                let mut node =
                    PersistedNode::new(parent_db, item.normalized_name().clone(), item.node_type)
                        .with_size(item.size);
                node.set_id(source_side, op.affected.id.clone());
                node.set_id(target_side, target_id.clone());
                node.created = Some(item.created_at);
                node.set_last_modified(source_side, item.last_modified);
                if let Some(mtime) = output.target_mtime() {
                    node.set_last_modified(target_side, mtime);
                }
                if let JobOutput::Remote(remote) = output {
                    node.set_name(ReplicaSide::Remote, SyncName::new(&remote.name));
                }
                node.checksum = item
                    .content_checksum
                    .clone()
                    .or_else(|| remote_checksum(output));
                if let Some(existing) = self.ctx.cache.db_id(target_side, target_id)? {
                    // Linked to an item that already had a row.
                    node.db_id = existing;
                    self.ctx.store.update_node(&node)?;
                } else {
                    self.ctx.store.insert_node(&node)?;
                }
            }
            OperationType::Edit => {
                if matches!(output, JobOutput::Unchanged) {
                    return Ok(());
                }
                let (Some(db_id), Some(item)) = (op.db_id, source.item(&op.affected.id)) else {
                    return Ok(());
                };
                let Some(mut node) = self.ctx.cache.node(db_id)? else {
                    return Ok(());
                };
                node.set_last_modified(source_side, item.last_modified);
                if let Some(mtime) = output.target_mtime() {
                    node.set_last_modified(target_side, mtime);
                }
                node.size = item.size;
                node.checksum = item
                    .content_checksum
                    .clone()
                    .or_else(|| remote_checksum(output));
                self.ctx.store.update_node(&node)?;
            }
            OperationType::Move => {
                let (Some(db_id), Some(item)) = (op.db_id, source.item(&op.affected.id)) else {
                    return Ok(());
                };
                let Some(mut node) = self.ctx.cache.node(db_id)? else {
                    return Ok(());
                };
                let Some(parent_db) = self.parent_db(source, &op.affected.id)? else {
                    return Ok(());
                };
                node.parent_id = Some(parent_db);
                node.set_name(source_side, item.normalized_name().clone());
                let target_name = match output {
                    JobOutput::Remote(remote) => SyncName::new(&remote.name),
                    _ => item.normalized_name().clone(),
                };
                node.set_name(target_side, target_name);
                self.ctx.store.update_node(&node)?;
            }
            OperationType::Delete => {
                if let Some(db_id) = op.db_id {
                    forget(self.ctx.store.delete_node(db_id))?;
                }
            }
            OperationType::UpdateMetadata | OperationType::Ignore => {}
        }
        Ok(())
    }

    /// Both replicas already agree; record what they agree on.
    fn commit_store_only(&self, op: &SyncOperation, replicas: Replicas<'_>) -> SyncResult<()> {
        let local_item = replicas.local.item(&op.affected.id);
        let remote_item = op
            .corresponding
            .as_ref()
            .and_then(|node| replicas.remote.item(&node.id));
        match op.op_type {
            OperationType::Delete => {
                if let Some(db_id) = op.db_id {
                    forget(self.ctx.store.delete_node(db_id))?;
                }
            }
            OperationType::Create => {
                let (Some(local_item), Some(remote_item)) = (local_item, remote_item) else {
                    return Ok(());
                };
                let Some(parent_db) = self.parent_db(replicas.local, &local_item.id)? else {
                    return Ok(());
                };
                let node = PersistedNode::new(
                    parent_db,
                    local_item.normalized_name().clone(),
                    local_item.node_type,
                );
                let node = agreed_node(node, local_item, remote_item);
                self.ctx.store.insert_node(&node)?;
            }
            OperationType::Edit | OperationType::Move => {
                let (Some(db_id), Some(local_item), Some(remote_item)) =
                    (op.db_id, local_item, remote_item)
                else {
                    return Ok(());
                };
                let Some(node) = self.ctx.cache.node(db_id)? else {
                    return Ok(());
                };
                let mut node = agreed_node(node, local_item, remote_item);
                if op.op_type == OperationType::Move {
                    if let Some(parent_db) = self.parent_db(replicas.local, &local_item.id)? {
                        node.parent_id = Some(parent_db);
                    }
                }
                self.ctx.store.update_node(&node)?;
            }
            OperationType::UpdateMetadata | OperationType::Ignore => {}
        }
        Ok(())
    }
}

/// Removes from `queue` every operation that cannot run once `failed`
/// failed, and returns their ids:
///
/// - operations that depend on it, transitively;
/// - operations on items below it in its source snapshot;
/// - other Moves of the same item.
pub fn remove_dependent_ops(
    queue: &mut SyncOperationList,
    failed: &SyncOperation,
    local: &Snapshot,
    remote: &Snapshot,
) -> Vec<OpId> {
    let source = match failed.source_side() {
        ReplicaSide::Local => local,
        ReplicaSide::Remote => remote,
    };
    let mut doomed: HashSet<OpId> = HashSet::from([failed.id]);
    for op in queue.iter() {
        let below = op.affected.side == failed.affected.side
            && source.is_ancestor(&failed.affected.id, &op.affected.id);
        let same_move = failed.op_type == OperationType::Move
            && op.op_type == OperationType::Move
            && op.affected.side == failed.affected.side
            && op.affected.id == failed.affected.id;
        if below || same_move {
            doomed.insert(op.id);
        }
    }
    loop {
        let more: Vec<OpId> = queue
            .iter()
            .filter(|op| !doomed.contains(&op.id))
            .filter(|op| op.depends_on.iter().any(|dep| doomed.contains(dep)))
            .map(|op| op.id)
            .collect();
        if more.is_empty() {
            break;
        }
        doomed.extend(more);
    }

    let mut removed: Vec<OpId> = queue
        .ids()
        .into_iter()
        .filter(|id| *id != failed.id && doomed.contains(id))
        .collect();
    removed.sort();
    for id in &removed {
        queue.remove(*id);
    }
    removed
}

fn snapshot_path(snapshot: &Snapshot, id: &NodeId) -> Result<PathBuf, JobError> {
    snapshot
        .path(id)
        .map_err(|err| JobError::NotFound(format!("{id}: {err}")))
}

fn source_item<'s>(snapshot: &'s Snapshot, id: &NodeId) -> Result<&'s SnapshotItem, JobError> {
    snapshot
        .item(id)
        .ok_or_else(|| JobError::NotFound(format!("{id} is gone from {}", snapshot.side())))
}

fn required_db_id(op: &SyncOperation) -> Result<DbNodeId, JobError> {
    op.db_id
        .ok_or_else(|| JobError::Inconsistency(format!("{op} has no persisted node")))
}

fn placeholder_info(item: &SnapshotItem) -> PlaceholderInfo {
    PlaceholderInfo {
        size: item.size,
        created_at: item.created_at,
        last_modified: item.last_modified,
    }
}

fn remote_checksum(output: &JobOutput) -> Option<String> {
    match output {
        JobOutput::Remote(item) => item.checksum.clone(),
        _ => None,
    }
}

/// `node` updated with the state both replicas report.
fn agreed_node(
    mut node: PersistedNode,
    local: &SnapshotItem,
    remote: &SnapshotItem,
) -> PersistedNode {
    node.local_id = Some(local.id.clone());
    node.remote_id = Some(remote.id.clone());
    node.name_local = local.normalized_name().clone();
    node.name_remote = remote.normalized_name().clone();
    node.created = Some(local.created_at);
    node.last_modified_local = Some(local.last_modified);
    node.last_modified_remote = Some(remote.last_modified);
    node.size = local.size;
    node.checksum = local
        .content_checksum
        .clone()
        .or_else(|| remote.content_checksum.clone());
    node
}

/// A row that is already gone was dropped with its parent's subtree.
fn forget(result: StoreResult<()>) -> StoreResult<()> {
    match result {
        Err(StoreError::NotFound(_)) => Ok(()),
        other => other,
    }
}
