//! Last-resort salvage of local content.
//!
//! Whatever would otherwise be lost (an edited file whose remote copy was
//! deleted, a remote edit whose local copy was deleted) lands in a folder at
//! the root of the local replica. Existing files there are never overwritten.

use crate::error::JobError;
use crate::events::{ErrorSink, EventCause, SyncEvent};
use crate::naming::numbered_name;
use crate::remote::{RemoteDrive, RetryPolicy, with_retry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use twinsync_types::{NodeId, ReplicaSide};

/// Gives up after this many taken names.
const MAX_ATTEMPTS: u32 = 1000;

pub struct FileRescuer {
    local_root: PathBuf,
    folder_name: String,
    events: Arc<dyn ErrorSink>,
}

impl FileRescuer {
    pub fn new(
        local_root: impl Into<PathBuf>,
        folder_name: impl Into<String>,
        events: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            local_root: local_root.into(),
            folder_name: folder_name.into(),
            events,
        }
    }

    /// Rescue folder, relative to the local root.
    pub fn folder(&self) -> &Path {
        Path::new(&self.folder_name)
    }

    pub async fn create_rescue_folder_if_needed(&self) -> Result<PathBuf, JobError> {
        let folder = self.local_root.join(&self.folder_name);
        tokio::fs::create_dir_all(&folder).await?;
        Ok(folder)
    }

    /// Relative destination for the `attempt`-th try at rescuing `name`.
    pub fn destination_path(&self, name: &str, attempt: u32, is_dir: bool) -> PathBuf {
        self.folder().join(numbered_name(name, attempt, is_dir))
    }

    /// First name in the rescue folder that is not taken yet, relative to
    /// the local root.
    async fn free_destination(&self, name: &str, is_dir: bool) -> Result<PathBuf, JobError> {
        self.create_rescue_folder_if_needed().await?;
        for attempt in 0..MAX_ATTEMPTS {
            let dest = self.destination_path(name, attempt, is_dir);
            if tokio::fs::symlink_metadata(self.local_root.join(&dest)).await.is_err() {
                return Ok(dest);
            }
        }
        Err(JobError::AlreadyExists(format!(
            "no free name for {name} in {}",
            self.folder_name
        )))
    }

    fn report(
        &self,
        rel_path: &Path,
        dest: &Path,
        origin_side: ReplicaSide,
        node_id: Option<&NodeId>,
    ) {
        let mut event = SyncEvent::new(
            EventCause::Rescued,
            rel_path,
            format!("moved to {}", dest.display()),
        )
        .with_dest(dest);
        if let Some(id) = node_id {
            event = event.on(origin_side, id.clone());
        }
        self.events.report(event);
    }

    /// Moves the item at `rel_path` into the rescue folder and returns its
    /// new relative path.
    pub async fn rescue(
        &self,
        rel_path: &Path,
        origin_side: ReplicaSide,
        node_id: Option<&NodeId>,
    ) -> Result<PathBuf, JobError> {
        let source = self.local_root.join(rel_path);
        let metadata = tokio::fs::symlink_metadata(&source).await?;
        let dest = self.free_destination(&file_name(rel_path)?, metadata.is_dir()).await?;
        tokio::fs::rename(&source, self.local_root.join(&dest)).await?;
        info!(from = %rel_path.display(), to = %dest.display(), "item rescued");
        self.report(rel_path, &dest, origin_side, node_id);
        Ok(dest)
    }

    /// Downloads remote file `remote_id`, last seen at `rel_path`, straight
    /// into the rescue folder. Used when the remote copy is about to be
    /// deleted and was never synced down.
    pub async fn rescue_remote(
        &self,
        remote: &dyn RemoteDrive,
        retry: RetryPolicy,
        remote_id: &NodeId,
        rel_path: &Path,
    ) -> Result<PathBuf, JobError> {
        let dest = self.free_destination(&file_name(rel_path)?, false).await?;
        let absolute = self.local_root.join(&dest);
        with_retry(retry, "download", || remote.download(remote_id, &absolute)).await?;
        info!(from = %rel_path.display(), to = %dest.display(), "remote item rescued");
        self.report(rel_path, &dest, ReplicaSide::Remote, Some(remote_id));
        Ok(dest)
    }
}

fn file_name(rel_path: &Path) -> Result<String, JobError> {
    rel_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| JobError::InvalidName(rel_path.display().to_string()))
}
