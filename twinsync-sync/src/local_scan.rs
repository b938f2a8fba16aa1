//! One-shot scan of the local replica into a [`Snapshot`].
//!
//! Items are keyed by inode number, so a rename or a move keeps its
//! identifier and shows up as a Move rather than a Delete plus a Create.

use crate::error::SyncResult;
use std::collections::HashMap;
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;
use twinsync_snapshot::{Snapshot, SnapshotItem};
use twinsync_types::{NodeId, NodeType, ReplicaSide, SyncTime};

/// Identifier of the file or directory at `path`.
pub fn local_node_id(path: &Path) -> io::Result<NodeId> {
    let metadata = fs::symlink_metadata(path)?;
    Ok(node_id_of(&metadata, path))
}

/// Async variant of [`local_node_id`] for use on the executor's tasks.
pub async fn local_node_id_async(path: &Path) -> io::Result<NodeId> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    Ok(node_id_of(&metadata, path))
}

#[cfg(unix)]
fn node_id_of(metadata: &Metadata, _path: &Path) -> NodeId {
    use std::os::unix::fs::MetadataExt;
    NodeId::new(metadata.ino().to_string())
}

#[cfg(not(unix))]
fn node_id_of(_metadata: &Metadata, path: &Path) -> NodeId {
    NodeId::new(path.to_string_lossy().into_owned())
}

fn to_sync_time(time: io::Result<std::time::SystemTime>) -> Option<SyncTime> {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as SyncTime)
}

/// Modification time in whole seconds, the resolution the store keeps.
pub fn modified_time(metadata: &Metadata) -> SyncTime {
    to_sync_time(metadata.modified()).unwrap_or(0)
}

pub fn created_time(metadata: &Metadata) -> SyncTime {
    to_sync_time(metadata.created()).unwrap_or_else(|| modified_time(metadata))
}

/// Builds a local snapshot of everything below `root`.
///
/// Symbolic links are not followed and not synced. The rescue folder at the
/// root is left out. An unreadable root is an error; anything below it that
/// cannot be read is logged and skipped.
pub fn scan_local(root: &Path, rescue_folder_name: &str) -> SyncResult<Snapshot> {
    let root_id = local_node_id(root)?;
    let mut snapshot = Snapshot::new(ReplicaSide::Local, root_id.clone());
    let mut dir_ids: HashMap<PathBuf, NodeId> = HashMap::new();
    dir_ids.insert(root.to_path_buf(), root_id);

    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == rescue_folder_name));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => return Err(io::Error::from(err).into()),
            Err(err) => {
                let err = io::Error::from(err);
                // Removed between listing and stat.
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(error = %err, "cannot read local item");
                }
                continue;
            }
        };
        let path = entry.path();
        if entry.path_is_symlink() {
            debug!(path = %path.display(), "skipping symbolic link");
            continue;
        }
        let Some(parent_id) = path.parent().and_then(|parent| dir_ids.get(parent)).cloned()
        else {
            continue;
        };
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(err) => {
                let err = io::Error::from(err);
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "cannot stat local item");
                }
                continue;
            }
        };
        let node_type = if metadata.is_dir() {
            NodeType::Directory
        } else {
            NodeType::File
        };
        let name = entry.file_name().to_string_lossy();
        let id = node_id_of(&metadata, path);
        let size = if metadata.is_dir() { 0 } else { metadata.len() };
        let item = SnapshotItem::new(id.clone(), parent_id, &name, node_type)
            .with_times(created_time(&metadata), modified_time(&metadata))
            .with_size(size)
            .with_rights(!metadata.permissions().readonly(), true);
        snapshot.update_item(item)?;
        if node_type.is_dir() {
            dir_ids.insert(path.to_path_buf(), id);
        }
    }

    debug!(root = %root.display(), items = snapshot.nb_items(), "local scan finished");
    Ok(snapshot)
}
