//! Remote drive abstraction.
//!
//! The executor talks to the remote replica only through [`RemoteDrive`].
//! Transport, authentication and chunked uploads live behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use twinsync_types::{NodeId, NodeType, SyncName, SyncTime};

/// Result type for remote calls.
pub type NetResult<T> = Result<T, NetError>;

/// Failure reported by the remote API or the network below it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    /// Non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The API answered with an error code in its body.
    #[error("API error {code}: {message}")]
    Api { code: String, message: String },

    /// The server asked us to slow down.
    #[error("rate limited")]
    RateLimited,

    /// Connection, DNS or timeout failure.
    #[error("network error: {0}")]
    Network(String),
}

impl NetError {
    /// Errors worth another attempt after a delay.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::RateLimited => true,
            Self::Http { status, .. } => *status >= 500 && *status != 507,
            Self::Api { .. } => false,
        }
    }
}

/// Item as described by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: NodeId,
    pub parent_id: NodeId,
    pub name: String,
    pub node_type: NodeType,
    pub size: u64,
    pub created_at: SyncTime,
    pub last_modified: SyncTime,
    pub checksum: Option<String>,
}

/// Calls the executor needs from the remote replica.
#[async_trait]
pub trait RemoteDrive: Send + Sync {
    async fn create_dir(&self, parent: &NodeId, name: &SyncName) -> NetResult<RemoteItem>;

    /// Uploads `source` as a new file under `parent`.
    async fn upload(&self, parent: &NodeId, name: &SyncName, source: &Path)
    -> NetResult<RemoteItem>;

    /// Replaces the content of an existing file.
    async fn upload_replace(&self, id: &NodeId, source: &Path) -> NetResult<RemoteItem>;

    /// Writes the content of `id` to `dest`.
    async fn download(&self, id: &NodeId, dest: &Path) -> NetResult<RemoteItem>;

    async fn move_item(
        &self,
        id: &NodeId,
        new_parent: &NodeId,
        new_name: &SyncName,
    ) -> NetResult<RemoteItem>;

    /// Moves `id` to the remote trash.
    async fn delete(&self, id: &NodeId) -> NetResult<()>;

    /// Looks a child up by normalized name.
    async fn find_child(&self, parent: &NodeId, name: &SyncName) -> NetResult<Option<RemoteItem>>;
}

// ── Retry ────────────────────────────────────────────────────────

/// Bounds for [`with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry. Doubles per attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Runs `f`, retrying transient failures with exponential backoff.
pub async fn with_retry<F, Fut, T>(policy: RetryPolicy, operation: &str, mut f: F) -> NetResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = NetResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_retries && err.is_transient() => {
                let delay = policy.base_delay.saturating_mul(2u32.saturating_pow(attempt));
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// An in-memory remote drive for testing.
pub mod mock {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use twinsync_snapshot::{Snapshot, SnapshotItem};
    use twinsync_types::ReplicaSide;

    #[derive(Debug, Clone)]
    struct Entry {
        item: RemoteItem,
        content: Vec<u8>,
    }

    #[derive(Debug, Clone)]
    struct Failure {
        op: &'static str,
        /// Item id or name the failure applies to. `None` matches any call.
        target: Option<String>,
        error: NetError,
        /// Remaining hits. `None` never runs out.
        remaining: Option<u32>,
    }

    #[derive(Debug, Default)]
    struct MockState {
        items: BTreeMap<NodeId, Entry>,
        next_id: u64,
        clock: SyncTime,
        failures: Vec<Failure>,
        calls: HashMap<&'static str, usize>,
    }

    impl MockState {
        fn tick(&mut self) -> SyncTime {
            self.clock += 1;
            self.clock
        }

        fn allocate(&mut self) -> NodeId {
            self.next_id += 1;
            NodeId::new(format!("r{}", self.next_id))
        }

        fn children(&self, parent: &NodeId) -> Vec<&Entry> {
            self.items
                .values()
                .filter(|e| e.item.parent_id == *parent && e.item.id != e.item.parent_id)
                .collect()
        }

        fn child(&self, parent: &NodeId, name: &SyncName) -> Option<&Entry> {
            self.children(parent)
                .into_iter()
                .find(|e| SyncName::new(&e.item.name) == *name)
        }

        fn require_dir(&self, id: &NodeId) -> NetResult<()> {
            match self.items.get(id) {
                Some(e) if e.item.node_type.is_dir() => Ok(()),
                Some(_) => Err(NetError::Api {
                    code: "not_a_directory".into(),
                    message: id.to_string(),
                }),
                None => Err(not_found(id)),
            }
        }

        fn check_free(
            &self,
            parent: &NodeId,
            name: &SyncName,
            except: Option<&NodeId>,
        ) -> NetResult<()> {
            match self.child(parent, name) {
                Some(e) if Some(&e.item.id) != except => Err(NetError::Api {
                    code: "destination_already_exists".into(),
                    message: name.to_string(),
                }),
                _ => Ok(()),
            }
        }

        fn insert(
            &mut self,
            parent: &NodeId,
            name: &str,
            node_type: NodeType,
            content: Vec<u8>,
            mtime: Option<SyncTime>,
        ) -> RemoteItem {
            let id = self.allocate();
            let now = self.tick();
            let item = RemoteItem {
                id: id.clone(),
                parent_id: parent.clone(),
                name: name.to_string(),
                node_type,
                size: content.len() as u64,
                created_at: now,
                last_modified: mtime.unwrap_or(now),
                checksum: None,
            };
            self.items.insert(
                id,
                Entry {
                    item: item.clone(),
                    content,
                },
            );
            item
        }

        fn remove_subtree(&mut self, id: &NodeId) {
            let mut stack = vec![id.clone()];
            while let Some(current) = stack.pop() {
                let children: Vec<NodeId> = self
                    .children(&current)
                    .into_iter()
                    .map(|e| e.item.id.clone())
                    .collect();
                stack.extend(children);
                self.items.remove(&current);
            }
        }

        fn is_ancestor(&self, candidate: &NodeId, id: &NodeId) -> bool {
            let mut current = self.items.get(id).map(|e| e.item.parent_id.clone());
            let mut steps = 0;
            while let Some(parent) = current {
                if parent == *candidate {
                    return true;
                }
                let next = self.items.get(&parent).map(|e| e.item.parent_id.clone());
                if next.as_ref() == Some(&parent) || steps > self.items.len() {
                    return false;
                }
                steps += 1;
                current = next;
            }
            false
        }
    }

    fn not_found(id: &NodeId) -> NetError {
        NetError::Http {
            status: 404,
            message: format!("{id} not found"),
        }
    }

    async fn read_source(source: &Path) -> NetResult<(Vec<u8>, Option<SyncTime>)> {
        let content = tokio::fs::read(source).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => NetError::Http {
                status: 404,
                message: format!("{} vanished before upload", source.display()),
            },
            _ => NetError::Network(format!("reading {}: {e}", source.display())),
        })?;
        let mtime = tokio::fs::metadata(source)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as SyncTime);
        Ok((content, mtime))
    }

    /// A remote drive held in memory.
    ///
    /// Ids are allocated as `r1`, `r2`, ... and the root keeps the id given
    /// to [`MockRemote::new`]. Failures can be injected per call name
    /// (`"create_dir"`, `"upload"`, `"upload_replace"`, `"download"`,
    /// `"move_item"`, `"delete"`, `"find_child"`).
    #[derive(Debug)]
    pub struct MockRemote {
        root: NodeId,
        state: Mutex<MockState>,
    }

    impl MockRemote {
        pub fn new(root: impl Into<NodeId>) -> Self {
            let root = root.into();
            let mut state = MockState {
                clock: 1_000_000,
                ..MockState::default()
            };
            state.items.insert(
                root.clone(),
                Entry {
                    item: RemoteItem {
                        id: root.clone(),
                        parent_id: root.clone(),
                        name: String::new(),
                        node_type: NodeType::Directory,
                        size: 0,
                        created_at: 0,
                        last_modified: 0,
                        checksum: None,
                    },
                    content: Vec::new(),
                },
            );
            Self {
                root,
                state: Mutex::new(state),
            }
        }

        fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Counts the call and returns an injected failure, if one matches.
        fn enter(&self, op: &'static str, targets: &[&str]) -> NetResult<()> {
            let mut state = self.state();
            *state.calls.entry(op).or_default() += 1;
            let hit = state.failures.iter().position(|f| {
                f.op == op
                    && f.target
                        .as_deref()
                        .is_none_or(|t| targets.iter().any(|candidate| *candidate == t))
            });
            let Some(index) = hit else {
                return Ok(());
            };
            let failure = &mut state.failures[index];
            let error = failure.error.clone();
            let exhausted = match failure.remaining.as_mut() {
                Some(remaining) => {
                    *remaining -= 1;
                    *remaining == 0
                }
                None => false,
            };
            if exhausted {
                state.failures.remove(index);
            }
            Err(error)
        }

        pub fn root_id(&self) -> NodeId {
            self.root.clone()
        }

        // ── Test setup ──────────────────────────────────────────

        pub fn add_dir(&self, parent: &NodeId, name: &str) -> NodeId {
            self.state()
                .insert(parent, name, NodeType::Directory, Vec::new(), None)
                .id
        }

        pub fn add_file(&self, parent: &NodeId, name: &str, content: &[u8]) -> NodeId {
            self.state()
                .insert(parent, name, NodeType::File, content.to_vec(), None)
                .id
        }

        /// Replaces a file's content as another client would.
        pub fn edit_file(&self, id: &NodeId, content: &[u8]) {
            let mut state = self.state();
            let now = state.tick();
            if let Some(entry) = state.items.get_mut(id) {
                entry.content = content.to_vec();
                entry.item.size = content.len() as u64;
                entry.item.last_modified = now;
            }
        }

        /// Moves or renames an item as another client would.
        pub fn relocate(&self, id: &NodeId, parent: &NodeId, name: &str) {
            if let Some(entry) = self.state().items.get_mut(id) {
                entry.item.parent_id = parent.clone();
                entry.item.name = name.to_string();
            }
        }

        /// Deletes an item and its subtree as another client would.
        pub fn remove(&self, id: &NodeId) {
            self.state().remove_subtree(id);
        }

        pub fn contains(&self, id: &NodeId) -> bool {
            self.state().items.contains_key(id)
        }

        pub fn item(&self, id: &NodeId) -> Option<RemoteItem> {
            self.state().items.get(id).map(|e| e.item.clone())
        }

        pub fn content(&self, id: &NodeId) -> Option<Vec<u8>> {
            self.state().items.get(id).map(|e| e.content.clone())
        }

        /// Resolves a `/`-separated path from the root.
        pub fn id_by_path(&self, path: &str) -> Option<NodeId> {
            let state = self.state();
            let mut current = self.root.clone();
            for name in path.split('/').filter(|s| !s.is_empty()) {
                current = state.child(&current, &SyncName::new(name))?.item.id.clone();
            }
            Some(current)
        }

        /// Number of items, root included.
        pub fn len(&self) -> usize {
            self.state().items.len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() <= 1
        }

        /// Fails the next call to `op`, whatever its target.
        pub fn fail_next(&self, op: &'static str, error: NetError) {
            self.state().failures.push(Failure {
                op,
                target: None,
                error,
                remaining: Some(1),
            });
        }

        /// Fails every call to `op` on the item with this id or name.
        pub fn fail_on(&self, op: &'static str, target: &str, error: NetError) {
            self.state().failures.push(Failure {
                op,
                target: Some(target.to_string()),
                error,
                remaining: None,
            });
        }

        pub fn clear_failures(&self) {
            self.state().failures.clear();
        }

        /// How many times `op` was called, failed calls included.
        pub fn calls(&self, op: &str) -> usize {
            self.state().calls.get(op).copied().unwrap_or(0)
        }

        /// Current tree as a remote-side snapshot.
        pub fn snapshot(&self) -> Snapshot {
            let state = self.state();
            let mut snapshot = Snapshot::new(ReplicaSide::Remote, self.root.clone());
            let mut stack = vec![self.root.clone()];
            while let Some(parent) = stack.pop() {
                for entry in state.children(&parent) {
                    let item = &entry.item;
                    let snapshot_item = SnapshotItem::new(
                        item.id.clone(),
                        parent.clone(),
                        &item.name,
                        item.node_type,
                    )
                    .with_times(item.created_at, item.last_modified)
                    .with_size(item.size);
                    let snapshot_item = match &item.checksum {
                        Some(sum) => snapshot_item.with_checksum(sum.clone()),
                        None => snapshot_item,
                    };
                    // Parents are inserted before their children.
                    if snapshot.update_item(snapshot_item).is_ok() && item.node_type.is_dir() {
                        stack.push(item.id.clone());
                    }
                }
            }
            snapshot
        }
    }

    #[async_trait]
    impl RemoteDrive for MockRemote {
        async fn create_dir(&self, parent: &NodeId, name: &SyncName) -> NetResult<RemoteItem> {
            self.enter("create_dir", &[parent.as_str(), name.as_str()])?;
            let mut state = self.state();
            state.require_dir(parent)?;
            state.check_free(parent, name, None)?;
            Ok(state.insert(parent, name.as_str(), NodeType::Directory, Vec::new(), None))
        }

        async fn upload(
            &self,
            parent: &NodeId,
            name: &SyncName,
            source: &Path,
        ) -> NetResult<RemoteItem> {
            self.enter("upload", &[parent.as_str(), name.as_str()])?;
            let (content, mtime) = read_source(source).await?;
            let mut state = self.state();
            state.require_dir(parent)?;
            state.check_free(parent, name, None)?;
            Ok(state.insert(parent, name.as_str(), NodeType::File, content, mtime))
        }

        async fn upload_replace(&self, id: &NodeId, source: &Path) -> NetResult<RemoteItem> {
            let name = self.item(id).map(|i| i.name).unwrap_or_default();
            self.enter("upload_replace", &[id.as_str(), name.as_str()])?;
            let (content, mtime) = read_source(source).await?;
            let mut state = self.state();
            let now = state.tick();
            let entry = state.items.get_mut(id).ok_or_else(|| not_found(id))?;
            entry.item.size = content.len() as u64;
            entry.item.last_modified = mtime.unwrap_or(now);
            entry.content = content;
            Ok(entry.item.clone())
        }

        async fn download(&self, id: &NodeId, dest: &Path) -> NetResult<RemoteItem> {
            let name = self.item(id).map(|i| i.name).unwrap_or_default();
            self.enter("download", &[id.as_str(), name.as_str()])?;
            let (item, content) = {
                let state = self.state();
                let entry = state.items.get(id).ok_or_else(|| not_found(id))?;
                (entry.item.clone(), entry.content.clone())
            };
            tokio::fs::write(dest, content)
                .await
                .map_err(|e| NetError::Network(format!("writing {}: {e}", dest.display())))?;
            Ok(item)
        }

        async fn move_item(
            &self,
            id: &NodeId,
            new_parent: &NodeId,
            new_name: &SyncName,
        ) -> NetResult<RemoteItem> {
            self.enter("move_item", &[id.as_str(), new_name.as_str()])?;
            let mut state = self.state();
            if !state.items.contains_key(id) {
                return Err(not_found(id));
            }
            state.require_dir(new_parent)?;
            state.check_free(new_parent, new_name, Some(id))?;
            if id == new_parent || state.is_ancestor(id, new_parent) {
                return Err(NetError::Api {
                    code: "move_into_itself".into(),
                    message: id.to_string(),
                });
            }
            let entry = state.items.get_mut(id).ok_or_else(|| not_found(id))?;
            entry.item.parent_id = new_parent.clone();
            entry.item.name = new_name.to_string();
            Ok(entry.item.clone())
        }

        async fn delete(&self, id: &NodeId) -> NetResult<()> {
            let name = self.item(id).map(|i| i.name).unwrap_or_default();
            self.enter("delete", &[id.as_str(), name.as_str()])?;
            let mut state = self.state();
            if !state.items.contains_key(id) {
                return Err(not_found(id));
            }
            state.remove_subtree(id);
            Ok(())
        }

        async fn find_child(
            &self,
            parent: &NodeId,
            name: &SyncName,
        ) -> NetResult<Option<RemoteItem>> {
            self.enter("find_child", &[parent.as_str(), name.as_str()])?;
            Ok(self.state().child(parent, name).map(|e| e.item.clone()))
        }
    }
}
