//! Sync configuration.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Exclusion settings applied before a Create is emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusionConfig {
    /// Glob patterns matched against item names and relative paths.
    pub patterns: Vec<String>,
    /// Files larger than this are not created on the other side.
    pub max_file_size: Option<u64>,
    /// Longest relative path, in bytes, that is synced.
    pub max_path_length: usize,
    /// Replica ids or relative path prefixes that bypass the size ceiling
    /// and the temporary blacklist.
    pub whitelist: Vec<String>,
}

impl Default for ExclusionConfig {
    fn default() -> Self {
        Self {
            patterns: vec![
                ".DS_Store".to_string(),
                "*.tmp".to_string(),
                "~$*".to_string(),
                ".~lock.*#".to_string(),
            ],
            max_file_size: None,
            max_path_length: 4096,
            whitelist: Vec::new(),
        }
    }
}

/// Configuration for a sync pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root of the local replica.
    pub local_root: PathBuf,
    /// Directory under `local_root` that receives rescued content.
    pub rescue_folder_name: String,
    /// Marker inserted before the extension of conflict copies.
    pub conflict_suffix: String,
    /// Maximum number of transfer jobs in flight.
    pub max_parallel_jobs: usize,
    /// Retries for transient network errors.
    pub network_retries: u32,
    /// Delay before the first network retry (ms); doubles per attempt.
    pub retry_base_delay_ms: u64,
    /// How long a temporarily blacklisted item stays out of sync (s).
    pub tmp_blacklist_ttl_secs: u64,
    /// Whether local files are created as virtual-filesystem placeholders.
    pub vfs_enabled: bool,
    /// Remote top-level folders that accept directories but not files.
    pub protected_remote_dirs: Vec<String>,
    pub exclusion: ExclusionConfig,
    /// Pause between two cycles of the worker (ms).
    pub cycle_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_root: PathBuf::new(),
            rescue_folder_name: "Rescued Files".to_string(),
            conflict_suffix: "_conflict_".to_string(),
            max_parallel_jobs: 4,
            network_retries: 1,
            retry_base_delay_ms: 500,
            tmp_blacklist_ttl_secs: 3600,
            vfs_enabled: false,
            protected_remote_dirs: vec!["Common documents".to_string(), "Shared".to_string()],
            exclusion: ExclusionConfig::default(),
            cycle_interval_ms: 5_000,
        }
    }
}

impl SyncConfig {
    /// Default config rooted at `local_root`.
    pub fn for_root(local_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            ..Default::default()
        }
    }

    /// Parses a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.max_parallel_jobs == 0 {
            return Err(SyncError::Config("max_parallel_jobs must be at least 1".into()));
        }
        if self.rescue_folder_name.is_empty() || self.rescue_folder_name.contains('/') {
            return Err(SyncError::Config(format!(
                "invalid rescue folder name {:?}",
                self.rescue_folder_name
            )));
        }
        if self.conflict_suffix.is_empty() {
            return Err(SyncError::Config("conflict_suffix must not be empty".into()));
        }
        Ok(())
    }

    pub fn tmp_blacklist_ttl(&self) -> Duration {
        Duration::from_secs(self.tmp_blacklist_ttl_secs)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }
}
