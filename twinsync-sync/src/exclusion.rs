//! Exclusion rules and the temporary blacklist.
//!
//! Both are consulted by the change detector before a Create is emitted.
//! The blacklist is also fed by the executor when an item keeps failing.

use crate::config::ExclusionConfig;
use crate::error::{SyncError, SyncResult};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use twinsync_snapshot::SnapshotItem;
use twinsync_types::{NodeId, ReplicaSide};

/// Why an item is kept out of sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    Pattern,
    TooLarge,
    PathTooLong,
    TmpBlacklisted,
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pattern => "matches an exclusion pattern",
            Self::TooLarge => "exceeds the size limit",
            Self::PathTooLong => "path is too long",
            Self::TmpBlacklisted => "temporarily blacklisted after errors",
        })
    }
}

/// Compiled [`ExclusionConfig`].
#[derive(Debug)]
pub struct ExclusionRules {
    patterns: GlobSet,
    max_file_size: Option<u64>,
    max_path_length: usize,
    whitelist: Vec<String>,
}

impl ExclusionRules {
    pub fn new(config: &ExclusionConfig) -> SyncResult<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| SyncError::Config(format!("bad exclusion pattern {pattern:?}: {e}")))?;
            builder.add(glob);
        }
        let patterns = builder
            .build()
            .map_err(|e| SyncError::Config(format!("exclusion patterns: {e}")))?;
        Ok(Self {
            patterns,
            max_file_size: config.max_file_size,
            max_path_length: config.max_path_length,
            whitelist: config.whitelist.clone(),
        })
    }

    /// Whitelist entries are replica ids or relative path prefixes.
    fn is_whitelisted(&self, id: &NodeId, rel_path: &Path) -> bool {
        self.whitelist
            .iter()
            .any(|entry| entry == id.as_str() || rel_path.starts_with(entry))
    }

    pub fn matches_pattern(&self, rel_path: &Path) -> bool {
        let by_name = rel_path
            .file_name()
            .is_some_and(|name| self.patterns.is_match(name));
        by_name || self.patterns.is_match(rel_path)
    }

    /// Returns the first rule that excludes the item, if any.
    ///
    /// A whitelisted item still obeys the path-length ceiling and the name
    /// patterns but skips the size ceiling and the temporary blacklist.
    pub fn check(
        &self,
        side: ReplicaSide,
        item: &SnapshotItem,
        rel_path: &Path,
        blacklist: &TmpBlacklist,
    ) -> Option<Exclusion> {
        let whitelisted = self.is_whitelisted(&item.id, rel_path);

        if rel_path.as_os_str().len() > self.max_path_length {
            return Some(Exclusion::PathTooLong);
        }
        if self.matches_pattern(rel_path) {
            return Some(Exclusion::Pattern);
        }
        if whitelisted {
            return None;
        }
        if let Some(max) = self.max_file_size {
            if !item.is_dir() && item.size > max {
                return Some(Exclusion::TooLarge);
            }
        }
        if blacklist.is_blacklisted(side, &item.id)
            || blacklist.is_path_blacklisted(side, rel_path)
        {
            return Some(Exclusion::TmpBlacklisted);
        }
        None
    }
}

// ── Temporary blacklist ──────────────────────────────────────────

/// Errors before an item is blacklisted.
const BLACKLIST_THRESHOLD: u32 = 2;

#[derive(Debug, Clone)]
struct BlacklistEntry {
    path: PathBuf,
    errors: u32,
    last_error: Instant,
}

/// Items that keep failing are left out of sync for a while.
#[derive(Debug)]
pub struct TmpBlacklist {
    ttl: Duration,
    entries: Mutex<HashMap<(ReplicaSide, NodeId), BlacklistEntry>>,
}

impl TmpBlacklist {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<(ReplicaSide, NodeId), BlacklistEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_active(&self, entry: &BlacklistEntry) -> bool {
        entry.errors >= BLACKLIST_THRESHOLD && entry.last_error.elapsed() < self.ttl
    }

    /// Records one more error. Returns true once the item is blacklisted.
    pub fn increase_error_count(&self, side: ReplicaSide, id: &NodeId, path: &Path) -> bool {
        let mut entries = self.entries();
        let entry = entries
            .entry((side, id.clone()))
            .or_insert_with(|| BlacklistEntry {
                path: path.to_path_buf(),
                errors: 0,
                last_error: Instant::now(),
            });
        entry.errors += 1;
        entry.path = path.to_path_buf();
        entry.last_error = Instant::now();
        let blacklisted = entry.errors >= BLACKLIST_THRESHOLD;
        if blacklisted {
            info!(side = %side, id = %id, path = %path.display(), "item temporarily blacklisted");
        } else {
            debug!(side = %side, id = %id, errors = entry.errors, "error recorded for item");
        }
        blacklisted
    }

    /// Blacklists an item right away.
    pub fn blacklist_item(&self, side: ReplicaSide, id: &NodeId, path: &Path) {
        info!(side = %side, id = %id, path = %path.display(), "item temporarily blacklisted");
        self.entries().insert(
            (side, id.clone()),
            BlacklistEntry {
                path: path.to_path_buf(),
                errors: BLACKLIST_THRESHOLD,
                last_error: Instant::now(),
            },
        );
    }

    pub fn is_blacklisted(&self, side: ReplicaSide, id: &NodeId) -> bool {
        self.entries()
            .get(&(side, id.clone()))
            .is_some_and(|e| self.is_active(e))
    }

    /// True if `path` is a blacklisted item or lies below one.
    pub fn is_path_blacklisted(&self, side: ReplicaSide, path: &Path) -> bool {
        self.entries()
            .iter()
            .any(|((s, _), e)| *s == side && self.is_active(e) && path.starts_with(&e.path))
    }

    pub fn remove(&self, side: ReplicaSide, id: &NodeId) {
        self.entries().remove(&(side, id.clone()));
    }

    /// Drops expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| e.last_error.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
