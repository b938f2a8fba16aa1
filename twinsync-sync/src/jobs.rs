//! Concrete jobs run by the executor.
//!
//! The executor turns each operation into a [`Job`] while it holds the
//! snapshots and the cache; the job itself only needs owned data, so it can
//! run on its own task.

use crate::error::JobError;
use crate::local_scan::{created_time, local_node_id_async, modified_time};
use crate::remote::{RemoteDrive, RemoteItem, RetryPolicy, with_retry};
use crate::rescuer::FileRescuer;
use crate::vfs::{PinState, PlaceholderInfo, Vfs, set_mtime};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use twinsync_types::{NodeId, ReplicaSide, SyncName, SyncTime};
use uuid::Uuid;

/// Identifier of a dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local item as found on disk after a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalState {
    pub id: NodeId,
    pub created_at: SyncTime,
    pub last_modified: SyncTime,
    pub size: u64,
}

/// What a successful job produced.
#[derive(Debug, Clone)]
pub enum JobOutput {
    Local(LocalState),
    Remote(RemoteItem),
    Rescued(PathBuf),
    /// The job succeeded; the store stays as it is.
    Unchanged,
    /// Nothing ran; only the store is to be updated.
    StoreOnly,
}

impl JobOutput {
    /// Identifier of the item on the side the job ran on.
    pub fn target_id(&self) -> Option<&NodeId> {
        match self {
            Self::Local(state) => Some(&state.id),
            Self::Remote(item) => Some(&item.id),
            _ => None,
        }
    }

    pub fn target_mtime(&self) -> Option<SyncTime> {
        match self {
            Self::Local(state) => Some(state.last_modified),
            Self::Remote(item) => Some(item.last_modified),
            _ => None,
        }
    }
}

pub type JobResult = Result<JobOutput, JobError>;

/// Shared handles a job runs with.
pub struct JobEnv {
    pub remote: Arc<dyn RemoteDrive>,
    pub vfs: Arc<dyn Vfs>,
    pub rescuer: Arc<FileRescuer>,
    pub retry: RetryPolicy,
    /// Synced local items are handed over to the VFS.
    pub placeholders: bool,
}

impl JobEnv {
    /// Registers a fully present local item with the VFS and keeps its
    /// content on disk.
    async fn convert_to_placeholder(
        &self,
        path: &Path,
        remote_id: &NodeId,
    ) -> Result<(), JobError> {
        if !self.placeholders {
            return Ok(());
        }
        self.vfs.convert_to_placeholder(path, remote_id).await?;
        self.vfs.set_pin_state(path, PinState::AlwaysLocal).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Job {
    CreateLocalDir { path: PathBuf, remote_id: NodeId },
    Download { remote_id: NodeId, dest: PathBuf, create: bool },
    CreatePlaceholder { dest: PathBuf, remote_id: NodeId, info: PlaceholderInfo },
    UpdatePlaceholder { path: PathBuf, info: PlaceholderInfo },
    /// Puts back the persisted mtime of a placeholder without content.
    RestoreMtime { path: PathBuf, mtime: SyncTime },
    CreateRemoteDir { parent: NodeId, name: SyncName, source: PathBuf },
    Upload { parent: NodeId, name: SyncName, source: PathBuf },
    UploadReplace { remote_id: NodeId, source: PathBuf },
    MoveLocal { from: PathBuf, to: PathBuf },
    MoveRemote { remote_id: NodeId, parent: NodeId, name: SyncName },
    DeleteLocal { path: PathBuf },
    DeleteRemote { remote_id: NodeId },
    Rescue { rel_path: PathBuf, node_id: NodeId },
    /// Downloads a remote item into the rescue folder.
    RescueRemote { remote_id: NodeId, rel_path: PathBuf },
    StoreOnly,
}

impl Job {
    /// Short jobs run on the control loop instead of their own task.
    pub fn is_inline(&self) -> bool {
        matches!(
            self,
            Self::CreateLocalDir { .. }
                | Self::CreateRemoteDir { .. }
                | Self::MoveLocal { .. }
                | Self::MoveRemote { .. }
                | Self::Rescue { .. }
                | Self::RestoreMtime { .. }
                | Self::StoreOnly
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateLocalDir { .. } => "create_local_dir",
            Self::Download { .. } => "download",
            Self::CreatePlaceholder { .. } => "create_placeholder",
            Self::UpdatePlaceholder { .. } => "update_placeholder",
            Self::RestoreMtime { .. } => "restore_mtime",
            Self::CreateRemoteDir { .. } => "create_dir",
            Self::Upload { .. } => "upload",
            Self::UploadReplace { .. } => "upload_replace",
            Self::MoveLocal { .. } => "move_local",
            Self::MoveRemote { .. } => "move_item",
            Self::DeleteLocal { .. } => "delete_local",
            Self::DeleteRemote { .. } => "delete",
            Self::Rescue { .. } => "rescue",
            Self::RescueRemote { .. } => "rescue_remote",
            Self::StoreOnly => "store_only",
        }
    }

    pub async fn run(self, env: Arc<JobEnv>) -> JobResult {
        debug!(job = self.name(), "running job");
        let remote = &env.remote;
        let retry = env.retry;
        match self {
            Self::CreateLocalDir { path, remote_id } => {
                tokio::fs::create_dir(&path).await?;
                env.convert_to_placeholder(&path, &remote_id).await?;
                Ok(JobOutput::Local(local_state(&path).await?))
            }
            Self::Download { remote_id, dest, create } => {
                if create && tokio::fs::symlink_metadata(&dest).await.is_ok() {
                    return Err(JobError::AlreadyExists(dest.display().to_string()));
                }
                let item =
                    with_retry(retry, "download", || remote.download(&remote_id, &dest)).await?;
                set_mtime(&dest, item.last_modified).await?;
                if env.placeholders {
                    env.vfs.update_fetch_status(&dest, item.size, item.size).await?;
                    env.convert_to_placeholder(&dest, &remote_id).await?;
                }
                Ok(JobOutput::Local(local_state(&dest).await?))
            }
            Self::CreatePlaceholder { dest, remote_id, info } => {
                if tokio::fs::symlink_metadata(&dest).await.is_ok() {
                    return Err(JobError::AlreadyExists(dest.display().to_string()));
                }
                env.vfs.create_placeholder(&dest, &remote_id, info).await?;
                Ok(JobOutput::Local(local_state(&dest).await?))
            }
            Self::UpdatePlaceholder { path, info } => {
                env.vfs.update_metadata(&path, info).await?;
                Ok(JobOutput::Local(local_state(&path).await?))
            }
            Self::RestoreMtime { path, mtime } => {
                set_mtime(&path, mtime).await?;
                Ok(JobOutput::Unchanged)
            }
            Self::CreateRemoteDir { parent, name, source } => {
                let item =
                    with_retry(retry, "create_dir", || remote.create_dir(&parent, &name)).await?;
                env.convert_to_placeholder(&source, &item.id).await?;
                Ok(JobOutput::Remote(item))
            }
            Self::Upload { parent, name, source } => {
                let item =
                    with_retry(retry, "upload", || remote.upload(&parent, &name, &source)).await?;
                env.convert_to_placeholder(&source, &item.id).await?;
                Ok(JobOutput::Remote(item))
            }
            Self::UploadReplace { remote_id, source } => {
                let item = with_retry(retry, "upload_replace", || {
                    remote.upload_replace(&remote_id, &source)
                })
                .await?;
                Ok(JobOutput::Remote(item))
            }
            Self::MoveLocal { from, to } => {
                let source = local_node_id_async(&from).await?;
                if let Ok(existing) = local_node_id_async(&to).await {
                    if existing != source {
                        return Err(JobError::AlreadyExists(to.display().to_string()));
                    }
                }
                tokio::fs::rename(&from, &to).await?;
                Ok(JobOutput::Local(local_state(&to).await?))
            }
            Self::MoveRemote { remote_id, parent, name } => {
                let item = with_retry(retry, "move_item", || {
                    remote.move_item(&remote_id, &parent, &name)
                })
                .await?;
                Ok(JobOutput::Remote(item))
            }
            Self::DeleteLocal { path } => {
                let metadata = tokio::fs::symlink_metadata(&path).await?;
                if metadata.is_dir() {
                    tokio::fs::remove_dir_all(&path).await?;
                } else {
                    tokio::fs::remove_file(&path).await?;
                }
                Ok(JobOutput::Unchanged)
            }
            Self::DeleteRemote { remote_id } => {
                with_retry(retry, "delete", || remote.delete(&remote_id)).await?;
                Ok(JobOutput::Unchanged)
            }
            Self::Rescue { rel_path, node_id } => {
                let dest = env
                    .rescuer
                    .rescue(&rel_path, ReplicaSide::Local, Some(&node_id))
                    .await?;
                Ok(JobOutput::Rescued(dest))
            }
            Self::RescueRemote { remote_id, rel_path } => {
                let dest = env
                    .rescuer
                    .rescue_remote(&**remote, retry, &remote_id, &rel_path)
                    .await?;
                Ok(JobOutput::Rescued(dest))
            }
            Self::StoreOnly => Ok(JobOutput::StoreOnly),
        }
    }
}

/// Stats `path` into a [`LocalState`].
pub async fn local_state(path: &Path) -> Result<LocalState, JobError> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    let id = local_node_id_async(path).await?;
    Ok(LocalState {
        id,
        created_at: created_time(&metadata),
        last_modified: modified_time(&metadata),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
    })
}
