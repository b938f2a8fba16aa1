//! SQLite node store.

use crate::error::{StoreError, StoreResult};
use crate::node::{PersistedNode, SyncStatus};
use crate::schema::{self, SchemaVersion};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use twinsync_types::{DbNodeId, NodeId, NodeType, ReplicaSide, SyncName};

const NODE_COLUMNS: &str = "node_id, parent_node_id, name_local, name_remote, local_id, remote_id, \
     created, last_modified_local, last_modified_remote, node_type, size, checksum, status, syncing";

/// Durable mapping from replica identifiers to internal node ids.
pub struct NodeStore {
    conn: Arc<Mutex<Connection>>,
    revision: AtomicU64,
    version: SchemaVersion,
}

impl NodeStore {
    /// Opens (or creates) a store at the given path.
    ///
    /// The root row is created on first open with the two replica root ids.
    pub fn open(
        path: impl AsRef<Path>,
        local_root: &NodeId,
        remote_root: &NodeId,
    ) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn, local_root, remote_root)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory(local_root: &NodeId, remote_root: &NodeId) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, local_root, remote_root)
    }

    fn from_connection(
        mut conn: Connection,
        local_root: &NodeId,
        remote_root: &NodeId,
    ) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;

        let found = schema::read_user_version(&conn)?;
        match SchemaVersion::from_user_version(found)? {
            None => SchemaVersion::CURRENT.install(&conn)?,
            Some(version) if version < SchemaVersion::CURRENT => {
                info!(from = ?version, "node store needs an upgrade");
                schema::upgrade(&mut conn, version, SchemaVersion::CURRENT)?;
            }
            Some(_) => {}
        }

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            revision: AtomicU64::new(1),
            version: SchemaVersion::CURRENT,
        };
        store.ensure_root(local_root, remote_root)?;
        Ok(store)
    }

    fn ensure_root(&self, local_root: &NodeId, remote_root: &NodeId) -> StoreResult<()> {
        let conn = self.conn()?;
        let existing: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT local_id, remote_id FROM node WHERE parent_node_id IS NULL",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match existing {
            None => {
                conn.execute(
                    "INSERT INTO node (parent_node_id, name_local, name_remote, local_id, remote_id, node_type, status)
                     VALUES (NULL, '', '', ?1, ?2, ?3, ?4)",
                    params![
                        local_root.as_str(),
                        remote_root.as_str(),
                        NodeType::Directory.as_str(),
                        SyncStatus::Synced.as_i64()
                    ],
                )?;
                debug!(local = %local_root, remote = %remote_root, "created root node");
            }
            Some((local, remote)) => {
                if local.as_deref() != Some(local_root.as_str())
                    || remote.as_deref() != Some(remote_root.as_str())
                {
                    return Err(StoreError::Corrupted(format!(
                        "root ids {local:?}/{remote:?} do not match {local_root}/{remote_root}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    /// Schema version of the open file.
    pub fn schema_version(&self) -> SchemaVersion {
        self.version
    }

    /// Bumped by every mutating write.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Internal id of the root row, if the table has not been cleared.
    pub fn root_id(&self) -> StoreResult<Option<DbNodeId>> {
        let conn = self.conn()?;
        let id: Option<i64> = conn
            .query_row(
                "SELECT node_id FROM node WHERE parent_node_id IS NULL",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(DbNodeId::new))
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Inserts a node and returns its new internal id.
    pub fn insert_node(&self, node: &PersistedNode) -> StoreResult<DbNodeId> {
        let parent = node
            .parent_id
            .ok_or_else(|| StoreError::Invalid("only the root may lack a parent".into()))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO node (parent_node_id, name_local, name_remote, local_id, remote_id,
                created, last_modified_local, last_modified_remote, node_type, size, checksum, status, syncing)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                parent.get(),
                node.name_local.as_str(),
                node.name_remote.as_str(),
                node.local_id.as_ref().map(NodeId::as_str),
                node.remote_id.as_ref().map(NodeId::as_str),
                node.created,
                node.last_modified_local,
                node.last_modified_remote,
                node.node_type.as_str(),
                node.size as i64,
                node.checksum,
                node.status.as_i64(),
                node.syncing,
            ],
        )?;
        let id = DbNodeId::new(conn.last_insert_rowid());
        drop(conn);
        self.bump();
        debug!(db_id = %id, name = %node.name_local, "inserted node");
        Ok(id)
    }

    /// Overwrites every column of an existing node.
    pub fn update_node(&self, node: &PersistedNode) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE node SET parent_node_id = ?2, name_local = ?3, name_remote = ?4, local_id = ?5,
                remote_id = ?6, created = ?7, last_modified_local = ?8, last_modified_remote = ?9,
                node_type = ?10, size = ?11, checksum = ?12, status = ?13, syncing = ?14
             WHERE node_id = ?1",
            params![
                node.db_id.get(),
                node.parent_id.map(DbNodeId::get),
                node.name_local.as_str(),
                node.name_remote.as_str(),
                node.local_id.as_ref().map(NodeId::as_str),
                node.remote_id.as_ref().map(NodeId::as_str),
                node.created,
                node.last_modified_local,
                node.last_modified_remote,
                node.node_type.as_str(),
                node.size as i64,
                node.checksum,
                node.status.as_i64(),
                node.syncing,
            ],
        )?;
        drop(conn);
        if changed == 0 {
            return Err(StoreError::NotFound(node.db_id.to_string()));
        }
        self.bump();
        Ok(())
    }

    /// Deletes a node and, through the foreign key, its whole subtree.
    pub fn delete_node(&self, db_id: DbNodeId) -> StoreResult<()> {
        let conn = self.conn()?;
        let parent: Option<Option<i64>> = conn
            .query_row(
                "SELECT parent_node_id FROM node WHERE node_id = ?1",
                params![db_id.get()],
                |row| row.get(0),
            )
            .optional()?;
        match parent {
            None => return Err(StoreError::NotFound(db_id.to_string())),
            Some(None) => return Err(StoreError::Invalid("the root node cannot be deleted".into())),
            Some(Some(_)) => {}
        }
        conn.execute("DELETE FROM node WHERE node_id = ?1", params![db_id.get()])?;
        drop(conn);
        self.bump();
        debug!(db_id = %db_id, "deleted node subtree");
        Ok(())
    }

    pub fn set_status(&self, db_id: DbNodeId, status: SyncStatus) -> StoreResult<()> {
        self.set_column(db_id, "status", status.as_i64())
    }

    pub fn set_syncing(&self, db_id: DbNodeId, syncing: bool) -> StoreResult<()> {
        self.set_column(db_id, "syncing", i64::from(syncing))
    }

    fn set_column(&self, db_id: DbNodeId, column: &str, value: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            &format!("UPDATE node SET {column} = ?2 WHERE node_id = ?1"),
            params![db_id.get(), value],
        )?;
        drop(conn);
        if changed == 0 {
            return Err(StoreError::NotFound(db_id.to_string()));
        }
        self.bump();
        Ok(())
    }

    /// Removes every row, root included. Used when a sync pair is reset.
    pub fn clear_nodes(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM node", [])?;
        drop(conn);
        self.bump();
        info!("cleared node store");
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn node(&self, db_id: DbNodeId) -> StoreResult<Option<PersistedNode>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM node WHERE node_id = ?1"),
                params![db_id.get()],
                RawNode::from_row,
            )
            .optional()?;
        raw.map(RawNode::into_node).transpose()
    }

    pub fn db_id(&self, side: ReplicaSide, id: &NodeId) -> StoreResult<Option<DbNodeId>> {
        let column = match side {
            ReplicaSide::Local => "local_id",
            ReplicaSide::Remote => "remote_id",
        };
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                &format!("SELECT node_id FROM node WHERE {column} = ?1"),
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.map(DbNodeId::new))
    }

    /// Every row, ordered by internal id.
    pub fn all_nodes(&self) -> StoreResult<Vec<PersistedNode>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {NODE_COLUMNS} FROM node ORDER BY node_id"))?;
        let raws = stmt
            .query_map([], RawNode::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawNode::into_node).collect()
    }

    pub fn node_count(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM node", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

/// Column values before validation.
struct RawNode {
    db_id: i64,
    parent_id: Option<i64>,
    name_local: String,
    name_remote: String,
    local_id: Option<String>,
    remote_id: Option<String>,
    created: Option<i64>,
    last_modified_local: Option<i64>,
    last_modified_remote: Option<i64>,
    node_type: String,
    size: i64,
    checksum: Option<String>,
    status: i64,
    syncing: bool,
}

impl RawNode {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            db_id: row.get(0)?,
            parent_id: row.get(1)?,
            name_local: row.get(2)?,
            name_remote: row.get(3)?,
            local_id: row.get(4)?,
            remote_id: row.get(5)?,
            created: row.get(6)?,
            last_modified_local: row.get(7)?,
            last_modified_remote: row.get(8)?,
            node_type: row.get(9)?,
            size: row.get(10)?,
            checksum: row.get(11)?,
            status: row.get(12)?,
            syncing: row.get(13)?,
        })
    }

    fn into_node(self) -> StoreResult<PersistedNode> {
        let corrupted = |what: &str| StoreError::Corrupted(format!("node {}: {what}", self.db_id));
        let name_local = SyncName::from_normalized(self.name_local.clone())
            .map_err(|_| corrupted("local name is not normalized"))?;
        let name_remote = SyncName::from_normalized(self.name_remote.clone())
            .map_err(|_| corrupted("remote name is not normalized"))?;
        let node_type: NodeType = self
            .node_type
            .parse()
            .map_err(|_| corrupted("unknown node type"))?;
        Ok(PersistedNode {
            db_id: DbNodeId::new(self.db_id),
            parent_id: self.parent_id.map(DbNodeId::new),
            name_local,
            name_remote,
            local_id: self.local_id.map(NodeId::from),
            remote_id: self.remote_id.map(NodeId::from),
            created: self.created,
            last_modified_local: self.last_modified_local,
            last_modified_remote: self.last_modified_remote,
            node_type,
            size: self.size.max(0) as u64,
            checksum: self.checksum,
            status: SyncStatus::from_i64(self.status),
            syncing: self.syncing,
        })
    }
}
