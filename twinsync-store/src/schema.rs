//! Schema versions and the upgrade state machine.
//!
//! The version lives in `PRAGMA user_version`. A fresh file is created at
//! [`SchemaVersion::CURRENT`]; an older file is walked forward one step at a
//! time, each step in its own transaction.

use crate::error::{StoreError, StoreResult};
use rusqlite::Connection;
use tracing::info;

/// Known layouts of the node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchemaVersion {
    /// Original layout: no checksum, status or syncing columns.
    V1,
    /// Adds content checksum, sync status and the syncing flag.
    V2,
}

impl SchemaVersion {
    pub const CURRENT: SchemaVersion = SchemaVersion::V2;

    pub const fn as_i64(self) -> i64 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    /// Maps a `user_version` value. `0` means no schema yet.
    pub fn from_user_version(v: i64) -> StoreResult<Option<Self>> {
        match v {
            0 => Ok(None),
            1 => Ok(Some(Self::V1)),
            2 => Ok(Some(Self::V2)),
            found => Err(StoreError::UnsupportedVersion {
                found,
                supported: Self::CURRENT.as_i64(),
            }),
        }
    }

    const fn next(self) -> Option<Self> {
        match self {
            Self::V1 => Some(Self::V2),
            Self::V2 => None,
        }
    }

    /// Creates the tables of this version in an empty database and stamps
    /// `user_version`.
    pub fn install(self, conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS node (
                node_id INTEGER PRIMARY KEY,
                parent_node_id INTEGER REFERENCES node(node_id) ON DELETE CASCADE,
                name_local TEXT NOT NULL,
                name_remote TEXT NOT NULL,
                local_id TEXT UNIQUE,
                remote_id TEXT UNIQUE,
                created INTEGER,
                last_modified_local INTEGER,
                last_modified_remote INTEGER,
                node_type TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS node_parent ON node(parent_node_id);
            ",
        )?;
        if self >= Self::V2 {
            add_v2_columns(conn)?;
        }
        set_user_version(conn, self)
    }
}

/// Walks the schema from `from` to `to`.
pub fn upgrade(conn: &mut Connection, from: SchemaVersion, to: SchemaVersion) -> StoreResult<()> {
    if from > to {
        return Err(StoreError::Migration(format!(
            "cannot downgrade from {from:?} to {to:?}"
        )));
    }
    let mut current = from;
    while current < to {
        let next = current
            .next()
            .ok_or_else(|| StoreError::Migration(format!("no step after {current:?}")))?;
        let tx = conn.transaction()?;
        match (current, next) {
            (SchemaVersion::V1, SchemaVersion::V2) => add_v2_columns(&tx)?,
            (a, b) => {
                return Err(StoreError::Migration(format!("no step from {a:?} to {b:?}")));
            }
        }
        set_user_version(&tx, next)?;
        tx.commit()?;
        info!(from = ?current, to = ?next, "upgraded node store schema");
        current = next;
    }
    Ok(())
}

fn add_v2_columns(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        ALTER TABLE node ADD COLUMN checksum TEXT;
        ALTER TABLE node ADD COLUMN status INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE node ADD COLUMN syncing INTEGER NOT NULL DEFAULT 0;
        ",
    )
    .map_err(|e| StoreError::Migration(format!("failed to add v2 columns: {e}")))
}

fn set_user_version(conn: &Connection, version: SchemaVersion) -> StoreResult<()> {
    conn.pragma_update(None, "user_version", version.as_i64())?;
    Ok(())
}

pub(crate) fn read_user_version(conn: &Connection) -> StoreResult<i64> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}
