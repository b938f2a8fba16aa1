use twinsync_types::{NodeId, NodeType, SyncName, SyncTime};

/// One item of a replica as last reported by its observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotItem {
    pub id: NodeId,
    /// `None` only for the root.
    pub parent_id: Option<NodeId>,
    name: String,
    normalized_name: SyncName,
    pub created_at: SyncTime,
    pub last_modified: SyncTime,
    pub node_type: NodeType,
    pub size: u64,
    pub is_link: bool,
    pub content_checksum: Option<String>,
    pub can_write: bool,
    pub can_share: bool,
    last_change_revision: u64,
}

impl SnapshotItem {
    /// Creates an item with zeroed times and size.
    pub fn new(
        id: impl Into<NodeId>,
        parent_id: impl Into<NodeId>,
        name: &str,
        node_type: NodeType,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: Some(parent_id.into()),
            name: name.to_string(),
            normalized_name: SyncName::new(name),
            created_at: 0,
            last_modified: 0,
            node_type,
            size: 0,
            is_link: false,
            content_checksum: None,
            can_write: true,
            can_share: true,
            last_change_revision: 0,
        }
    }

    pub fn file(id: impl Into<NodeId>, parent_id: impl Into<NodeId>, name: &str) -> Self {
        Self::new(id, parent_id, name, NodeType::File)
    }

    pub fn directory(id: impl Into<NodeId>, parent_id: impl Into<NodeId>, name: &str) -> Self {
        Self::new(id, parent_id, name, NodeType::Directory)
    }

    pub(crate) fn root(id: NodeId) -> Self {
        Self {
            parent_id: None,
            ..Self::new(id.clone(), id, "", NodeType::Directory)
        }
    }

    #[must_use]
    pub fn with_times(mut self, created_at: SyncTime, last_modified: SyncTime) -> Self {
        self.created_at = created_at;
        self.last_modified = last_modified;
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.content_checksum = Some(checksum.into());
        self
    }

    #[must_use]
    pub fn with_link(mut self, is_link: bool) -> Self {
        self.is_link = is_link;
        self
    }

    #[must_use]
    pub fn with_rights(mut self, can_write: bool, can_share: bool) -> Self {
        self.can_write = can_write;
        self.can_share = can_share;
        self
    }

    /// The name exactly as the replica reported it.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The canonical form of [`name`](Self::name), used for comparisons.
    pub fn normalized_name(&self) -> &SyncName {
        &self.normalized_name
    }

    /// Renames the item, keeping both name forms in step.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
        self.normalized_name = SyncName::new(name);
    }

    /// Snapshot revision at which this item was last written.
    pub fn last_change_revision(&self) -> u64 {
        self.last_change_revision
    }

    pub(crate) fn stamp(&mut self, revision: u64) {
        self.last_change_revision = revision;
    }

    pub fn is_dir(&self) -> bool {
        self.node_type.is_dir()
    }
}
