use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use twinsync_sync::{local_node_id, scan_local};
use twinsync_types::NodeType;

const RESCUE: &str = "Rescued Files";

/// root ── docs ── sub ── a.txt
///      │       └─ Rescued Files
///      ├─ Rescued Files ── old.txt
///      └─ link -> docs
fn make_tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("docs/sub")).unwrap();
    fs::write(root.join("docs/sub/a.txt"), "abc").unwrap();
    fs::create_dir(root.join("docs").join(RESCUE)).unwrap();
    fs::create_dir(root.join(RESCUE)).unwrap();
    fs::write(root.join(RESCUE).join("old.txt"), "old").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink(root.join("docs"), root.join("link")).unwrap();
    dir
}

#[test]
fn scan_keys_items_by_their_local_id() {
    let dir = make_tree();
    let snapshot = scan_local(dir.path(), RESCUE).unwrap();

    let a = snapshot.id_by_path(Path::new("docs/sub/a.txt")).unwrap();
    assert_eq!(a, &local_node_id(&dir.path().join("docs/sub/a.txt")).unwrap());
    let item = snapshot.item(a).unwrap();
    assert_eq!(item.node_type, NodeType::File);
    assert_eq!(item.size, 3);
    assert_eq!(
        snapshot.root_id(),
        &local_node_id(dir.path()).unwrap()
    );
    snapshot.check_integrity_recursively().unwrap();
}

#[test]
fn scan_skips_the_rescue_folder_and_links() {
    let dir = make_tree();
    let snapshot = scan_local(dir.path(), RESCUE).unwrap();

    // root, docs, docs/sub, docs/sub/a.txt, docs/Rescued Files
    assert_eq!(snapshot.nb_items(), 5);
    assert!(snapshot.id_by_path(Path::new(RESCUE)).is_none());
    assert!(snapshot.id_by_path(&Path::new("docs").join(RESCUE)).is_some());
    assert!(snapshot.id_by_path(Path::new("link")).is_none());
}

#[test]
fn missing_root_is_an_error() {
    let dir = TempDir::new().unwrap();
    assert!(scan_local(&dir.path().join("gone"), RESCUE).is_err());
}
