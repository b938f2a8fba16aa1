//! Platform virtual-filesystem contract.
//!
//! With a VFS, remote files appear locally as placeholders whose content is
//! fetched on demand. The executor only needs the handful of calls below;
//! the platform integration implements them.

use async_trait::async_trait;
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use twinsync_types::{NodeId, SyncTime};

/// Whether a placeholder's content should stay on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinState {
    #[default]
    Unspecified,
    AlwaysLocal,
    OnlineOnly,
}

/// State of a local item as seen by the VFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfsStatus {
    pub is_placeholder: bool,
    /// All content is on disk.
    pub is_hydrated: bool,
    /// A fetch is in progress.
    pub is_syncing: bool,
}

impl VfsStatus {
    /// A regular, fully present file.
    pub const MATERIALIZED: VfsStatus = VfsStatus {
        is_placeholder: false,
        is_hydrated: true,
        is_syncing: false,
    };

    /// Placeholder without local content.
    pub fn is_dehydrated(&self) -> bool {
        self.is_placeholder && !self.is_hydrated
    }
}

/// Metadata written onto a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderInfo {
    pub size: u64,
    pub created_at: SyncTime,
    pub last_modified: SyncTime,
}

#[async_trait]
pub trait Vfs: Send + Sync {
    /// Whether placeholders are used at all.
    fn is_enabled(&self) -> bool;

    async fn create_placeholder(
        &self,
        path: &Path,
        remote_id: &NodeId,
        info: PlaceholderInfo,
    ) -> io::Result<()>;

    /// Turns a fully present file into a placeholder.
    async fn convert_to_placeholder(&self, path: &Path, remote_id: &NodeId) -> io::Result<()>;

    async fn update_metadata(&self, path: &Path, info: PlaceholderInfo) -> io::Result<()>;

    /// Reports download progress of a placeholder being hydrated.
    async fn update_fetch_status(&self, path: &Path, received: u64, total: u64) -> io::Result<()>;

    async fn set_pin_state(&self, path: &Path, state: PinState) -> io::Result<()>;

    async fn status(&self, path: &Path) -> io::Result<VfsStatus>;
}

/// No virtual filesystem: every file is fully present.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVfs;

#[async_trait]
impl Vfs for NoopVfs {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn create_placeholder(
        &self,
        path: &Path,
        _: &NodeId,
        _: PlaceholderInfo,
    ) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no VFS to create a placeholder at {}", path.display()),
        ))
    }

    async fn convert_to_placeholder(&self, _: &Path, _: &NodeId) -> io::Result<()> {
        Ok(())
    }

    async fn update_metadata(&self, _: &Path, _: PlaceholderInfo) -> io::Result<()> {
        Ok(())
    }

    async fn update_fetch_status(&self, _: &Path, _: u64, _: u64) -> io::Result<()> {
        Ok(())
    }

    async fn set_pin_state(&self, _: &Path, _: PinState) -> io::Result<()> {
        Ok(())
    }

    async fn status(&self, _: &Path) -> io::Result<VfsStatus> {
        Ok(VfsStatus::MATERIALIZED)
    }
}

/// Sets a file's modification time, in seconds since the epoch.
///
/// Works on read-only files; the access time is left alone.
pub(crate) async fn set_mtime(path: &Path, mtime: SyncTime) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime, 0))
    })
    .await
    .map_err(io::Error::other)?
}

/// A recording VFS for testing.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    /// One call made against [`MockVfs`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum VfsCall {
        CreatePlaceholder(PathBuf),
        ConvertToPlaceholder(PathBuf),
        UpdateMetadata(PathBuf),
        UpdateFetchStatus(PathBuf),
        SetPinState(PathBuf, PinState),
    }

    #[derive(Debug, Default)]
    struct MockState {
        calls: Vec<VfsCall>,
        statuses: HashMap<PathBuf, VfsStatus>,
    }

    /// Placeholders are empty files of the advertised size; everything else
    /// is recorded.
    #[derive(Debug)]
    pub struct MockVfs {
        enabled: bool,
        state: Mutex<MockState>,
    }

    impl Default for MockVfs {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockVfs {
        pub fn new() -> Self {
            Self {
                enabled: true,
                state: Mutex::new(MockState::default()),
            }
        }

        fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub fn calls(&self) -> Vec<VfsCall> {
            self.state().calls.clone()
        }

        /// Forces the status reported for `path`.
        pub fn set_status(&self, path: impl Into<PathBuf>, status: VfsStatus) {
            self.state().statuses.insert(path.into(), status);
        }

        fn record(&self, call: VfsCall) {
            self.state().calls.push(call);
        }
    }

    #[async_trait]
    impl Vfs for MockVfs {
        fn is_enabled(&self) -> bool {
            self.enabled
        }

        async fn create_placeholder(
            &self,
            path: &Path,
            _remote_id: &NodeId,
            info: PlaceholderInfo,
        ) -> io::Result<()> {
            let file = tokio::fs::File::create(path).await?;
            file.set_len(info.size).await?;
            drop(file);
            set_mtime(path, info.last_modified).await?;
            self.record(VfsCall::CreatePlaceholder(path.to_path_buf()));
            self.set_status(
                path,
                VfsStatus {
                    is_placeholder: true,
                    is_hydrated: false,
                    is_syncing: false,
                },
            );
            Ok(())
        }

        async fn convert_to_placeholder(&self, path: &Path, _remote_id: &NodeId) -> io::Result<()> {
            self.record(VfsCall::ConvertToPlaceholder(path.to_path_buf()));
            self.set_status(
                path,
                VfsStatus {
                    is_placeholder: true,
                    is_hydrated: true,
                    is_syncing: false,
                },
            );
            Ok(())
        }

        async fn update_metadata(&self, path: &Path, info: PlaceholderInfo) -> io::Result<()> {
            let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
            file.set_len(info.size).await?;
            drop(file);
            set_mtime(path, info.last_modified).await?;
            self.record(VfsCall::UpdateMetadata(path.to_path_buf()));
            Ok(())
        }

        async fn update_fetch_status(
            &self,
            path: &Path,
            _received: u64,
            _total: u64,
        ) -> io::Result<()> {
            self.record(VfsCall::UpdateFetchStatus(path.to_path_buf()));
            Ok(())
        }

        async fn set_pin_state(&self, path: &Path, state: PinState) -> io::Result<()> {
            self.record(VfsCall::SetPinState(path.to_path_buf(), state));
            Ok(())
        }

        async fn status(&self, path: &Path) -> io::Result<VfsStatus> {
            Ok(self
                .state()
                .statuses
                .get(path)
                .copied()
                .unwrap_or(VfsStatus::MATERIALIZED))
        }
    }
}
