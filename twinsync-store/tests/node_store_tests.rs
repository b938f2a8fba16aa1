use pretty_assertions::assert_eq;
use twinsync_store::{NodeStore, PersistedNode, SchemaVersion, StoreError, SyncStatus};
use twinsync_types::{NodeId, NodeType, ReplicaSide, SyncName};

fn make_store() -> NodeStore {
    NodeStore::open_in_memory(&NodeId::from("l0"), &NodeId::from("r0")).unwrap()
}

fn file_node(store: &NodeStore, name: &str, local: &str, remote: &str) -> PersistedNode {
    let root = store.root_id().unwrap().unwrap();
    PersistedNode::new(root, SyncName::new(name), NodeType::File)
        .with_ids(local, remote)
        .with_times(100, 200, 200)
        .with_size(42)
}

// ── Open & root ──────────────────────────────────────────────────

#[test]
fn fresh_store_has_root_at_current_version() {
    let store = make_store();
    assert_eq!(store.schema_version(), SchemaVersion::CURRENT);
    let root = store.node(store.root_id().unwrap().unwrap()).unwrap().unwrap();
    assert!(root.is_root());
    assert_eq!(root.local_id, Some(NodeId::from("l0")));
    assert_eq!(root.remote_id, Some(NodeId::from("r0")));
    assert_eq!(store.node_count().unwrap(), 1);
}

#[test]
fn reopen_with_other_roots_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.db");
    NodeStore::open(&path, &NodeId::from("l0"), &NodeId::from("r0")).unwrap();
    let reopened = NodeStore::open(&path, &NodeId::from("l0"), &NodeId::from("r0"));
    assert!(reopened.is_ok());
    let other = NodeStore::open(&path, &NodeId::from("lX"), &NodeId::from("r0"));
    assert!(matches!(other, Err(StoreError::Corrupted(_))));
}

// ── Writes ───────────────────────────────────────────────────────

#[test]
fn insert_then_lookup_by_either_side() {
    let store = make_store();
    let node = file_node(&store, "a.txt", "l1", "r1");
    let id = store.insert_node(&node).unwrap();

    assert_eq!(store.db_id(ReplicaSide::Local, &NodeId::from("l1")).unwrap(), Some(id));
    assert_eq!(store.db_id(ReplicaSide::Remote, &NodeId::from("r1")).unwrap(), Some(id));

    let loaded = store.node(id).unwrap().unwrap();
    assert_eq!(loaded.name_local.as_str(), "a.txt");
    assert_eq!(loaded.size, 42);
    assert_eq!(loaded.last_modified(ReplicaSide::Remote), Some(200));
    assert_eq!(loaded.status, SyncStatus::Synced);
}

#[test]
fn every_write_bumps_revision() {
    let store = make_store();
    let r0 = store.revision();
    let id = store.insert_node(&file_node(&store, "a", "l1", "r1")).unwrap();
    let r1 = store.revision();
    assert!(r1 > r0);

    let mut node = store.node(id).unwrap().unwrap();
    node.size = 7;
    store.update_node(&node).unwrap();
    let r2 = store.revision();
    assert!(r2 > r1);

    store.set_syncing(id, true).unwrap();
    assert!(store.revision() > r2);
    assert!(store.node(id).unwrap().unwrap().syncing);
}

#[test]
fn reads_do_not_bump_revision() {
    let store = make_store();
    let r = store.revision();
    store.all_nodes().unwrap();
    store.root_id().unwrap();
    assert_eq!(store.revision(), r);
}

#[test]
fn delete_cascades_to_children() {
    let store = make_store();
    let root = store.root_id().unwrap().unwrap();
    let dir = store
        .insert_node(
            &PersistedNode::new(root, SyncName::new("d"), NodeType::Directory).with_ids("l1", "r1"),
        )
        .unwrap();
    let child = store
        .insert_node(
            &PersistedNode::new(dir, SyncName::new("f"), NodeType::File).with_ids("l2", "r2"),
        )
        .unwrap();

    store.delete_node(dir).unwrap();
    assert!(store.node(child).unwrap().is_none());
    assert_eq!(store.node_count().unwrap(), 1);
}

#[test]
fn root_cannot_be_deleted() {
    let store = make_store();
    let root = store.root_id().unwrap().unwrap();
    assert!(matches!(store.delete_node(root), Err(StoreError::Invalid(_))));
}

#[test]
fn duplicate_replica_id_is_rejected() {
    let store = make_store();
    store.insert_node(&file_node(&store, "a", "l1", "r1")).unwrap();
    let dup = store.insert_node(&file_node(&store, "b", "l1", "r2"));
    assert!(matches!(dup, Err(StoreError::Database(_))));
}

#[test]
fn update_missing_node_is_not_found() {
    let store = make_store();
    let mut node = file_node(&store, "a", "l1", "r1");
    node.db_id = twinsync_types::DbNodeId::new(999);
    assert!(matches!(store.update_node(&node), Err(StoreError::NotFound(_))));
}

#[test]
fn set_status_roundtrips() {
    let store = make_store();
    let id = store.insert_node(&file_node(&store, "a", "l1", "r1")).unwrap();
    store.set_status(id, SyncStatus::Conflict).unwrap();
    assert_eq!(store.node(id).unwrap().unwrap().status, SyncStatus::Conflict);
}

#[test]
fn unnormalized_row_is_reported_as_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.db");
    {
        let store = NodeStore::open(&path, &NodeId::from("l0"), &NodeId::from("r0")).unwrap();
        store.insert_node(&file_node(&store, "ok", "l1", "r1")).unwrap();
    }
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE node SET name_local = ?1 WHERE local_id = 'l1'",
            ["e\u{0301}"],
        )
        .unwrap();
    }
    let store = NodeStore::open(&path, &NodeId::from("l0"), &NodeId::from("r0")).unwrap();
    assert!(matches!(store.all_nodes(), Err(StoreError::Corrupted(_))));
}
