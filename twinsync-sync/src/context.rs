//! Everything a sync cycle needs, passed explicitly.

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::events::ErrorSink;
use crate::exclusion::{ExclusionRules, TmpBlacklist};
use crate::remote::{RemoteDrive, RetryPolicy};
use crate::rescuer::FileRescuer;
use crate::vfs::Vfs;
use std::sync::Arc;
use std::time::Duration;
use twinsync_store::{NodeCache, NodeStore};

/// Collaborators shared by the stages of a cycle.
pub struct SyncContext {
    pub config: SyncConfig,
    pub store: Arc<NodeStore>,
    pub cache: Arc<NodeCache>,
    pub remote: Arc<dyn RemoteDrive>,
    pub vfs: Arc<dyn Vfs>,
    pub events: Arc<dyn ErrorSink>,
    pub blacklist: Arc<TmpBlacklist>,
    pub exclusions: Arc<ExclusionRules>,
    pub rescuer: Arc<FileRescuer>,
}

impl SyncContext {
    pub fn new(
        config: SyncConfig,
        store: Arc<NodeStore>,
        remote: Arc<dyn RemoteDrive>,
        vfs: Arc<dyn Vfs>,
        events: Arc<dyn ErrorSink>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let exclusions = Arc::new(ExclusionRules::new(&config.exclusion)?);
        let blacklist = Arc::new(TmpBlacklist::new(config.tmp_blacklist_ttl()));
        let rescuer = Arc::new(FileRescuer::new(
            config.local_root.clone(),
            config.rescue_folder_name.clone(),
            Arc::clone(&events),
        ));
        let cache = Arc::new(NodeCache::new(Arc::clone(&store)));
        Ok(Self {
            config,
            store,
            cache,
            remote,
            vfs,
            events,
            blacklist,
            exclusions,
            rescuer,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.config.network_retries,
            base_delay: Duration::from_millis(self.config.retry_base_delay_ms),
        }
    }

    /// Whether local files are created as placeholders.
    pub fn uses_placeholders(&self) -> bool {
        self.config.vfs_enabled && self.vfs.is_enabled()
    }
}
