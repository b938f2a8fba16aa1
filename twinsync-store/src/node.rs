use serde::{Deserialize, Serialize};
use twinsync_types::{DbNodeId, NodeId, NodeType, ReplicaSide, SyncName, SyncTime};

/// Sync state recorded for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncStatus {
    #[default]
    Unknown,
    Synced,
    Conflict,
    Error,
}

impl SyncStatus {
    pub(crate) fn as_i64(self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::Synced => 1,
            Self::Conflict => 2,
            Self::Error => 3,
        }
    }

    pub(crate) fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Synced,
            2 => Self::Conflict,
            3 => Self::Error,
            _ => Self::Unknown,
        }
    }
}

/// The last-synced state of one logical item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedNode {
    /// Row id. Ignored by [`NodeStore::insert_node`](crate::NodeStore::insert_node).
    pub db_id: DbNodeId,
    /// `None` only for the root.
    pub parent_id: Option<DbNodeId>,
    pub name_local: SyncName,
    pub name_remote: SyncName,
    pub local_id: Option<NodeId>,
    pub remote_id: Option<NodeId>,
    pub created: Option<SyncTime>,
    pub last_modified_local: Option<SyncTime>,
    pub last_modified_remote: Option<SyncTime>,
    pub node_type: NodeType,
    pub size: u64,
    pub checksum: Option<String>,
    pub status: SyncStatus,
    pub syncing: bool,
}

impl PersistedNode {
    /// A node to be inserted under `parent`, with the same name on both
    /// sides.
    pub fn new(parent: DbNodeId, name: SyncName, node_type: NodeType) -> Self {
        Self {
            db_id: DbNodeId::new(0),
            parent_id: Some(parent),
            name_local: name.clone(),
            name_remote: name,
            local_id: None,
            remote_id: None,
            created: None,
            last_modified_local: None,
            last_modified_remote: None,
            node_type,
            size: 0,
            checksum: None,
            status: SyncStatus::Synced,
            syncing: false,
        }
    }

    #[must_use]
    pub fn with_ids(mut self, local: impl Into<NodeId>, remote: impl Into<NodeId>) -> Self {
        self.local_id = Some(local.into());
        self.remote_id = Some(remote.into());
        self
    }

    #[must_use]
    pub fn with_times(mut self, created: SyncTime, local: SyncTime, remote: SyncTime) -> Self {
        self.created = Some(created);
        self.last_modified_local = Some(local);
        self.last_modified_remote = Some(remote);
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn id(&self, side: ReplicaSide) -> Option<&NodeId> {
        match side {
            ReplicaSide::Local => self.local_id.as_ref(),
            ReplicaSide::Remote => self.remote_id.as_ref(),
        }
    }

    pub fn set_id(&mut self, side: ReplicaSide, id: NodeId) {
        match side {
            ReplicaSide::Local => self.local_id = Some(id),
            ReplicaSide::Remote => self.remote_id = Some(id),
        }
    }

    pub fn name(&self, side: ReplicaSide) -> &SyncName {
        match side {
            ReplicaSide::Local => &self.name_local,
            ReplicaSide::Remote => &self.name_remote,
        }
    }

    pub fn set_name(&mut self, side: ReplicaSide, name: SyncName) {
        match side {
            ReplicaSide::Local => self.name_local = name,
            ReplicaSide::Remote => self.name_remote = name,
        }
    }

    pub fn last_modified(&self, side: ReplicaSide) -> Option<SyncTime> {
        match side {
            ReplicaSide::Local => self.last_modified_local,
            ReplicaSide::Remote => self.last_modified_remote,
        }
    }

    pub fn set_last_modified(&mut self, side: ReplicaSide, time: SyncTime) {
        match side {
            ReplicaSide::Local => self.last_modified_local = Some(time),
            ReplicaSide::Remote => self.last_modified_remote = Some(time),
        }
    }
}
