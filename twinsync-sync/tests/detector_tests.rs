use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use twinsync_snapshot::{Snapshot, SnapshotItem};
use twinsync_store::{NodeCache, NodeStore, PersistedNode};
use twinsync_sync::{
    ChangeDetector, EventCause, ExclusionConfig, ExclusionRules, FsOperationSet, MemoryErrorSink,
    TmpBlacklist,
};
use twinsync_types::{DbNodeId, NodeId, NodeType, OperationType, ReplicaSide, SyncName};

const RESCUE: &str = "Rescued Files";

struct Fixture {
    store: Arc<NodeStore>,
    cache: NodeCache,
    rules: ExclusionRules,
    blacklist: TmpBlacklist,
    events: MemoryErrorSink,
}

impl Fixture {
    fn detect(&self, snapshot: &Snapshot) -> FsOperationSet {
        ChangeDetector::new(&self.cache, &self.rules, &self.blacklist, RESCUE)
            .with_events(&self.events)
            .detect(snapshot)
            .unwrap()
    }

    fn root(&self) -> DbNodeId {
        self.store.root_id().unwrap().unwrap()
    }

    fn insert(
        &self,
        parent: DbNodeId,
        name: &str,
        node_type: NodeType,
        ids: (&str, &str),
    ) -> DbNodeId {
        let node = PersistedNode::new(parent, SyncName::new(name), node_type)
            .with_ids(ids.0, ids.1)
            .with_times(100, 200, 300)
            .with_size(if node_type.is_dir() { 0 } else { 5 });
        self.store.insert_node(&node).unwrap()
    }
}

fn make_fixture() -> Fixture {
    let store =
        Arc::new(NodeStore::open_in_memory(&NodeId::from("l0"), &NodeId::from("r0")).unwrap());
    let cache = NodeCache::new(Arc::clone(&store));
    Fixture {
        store,
        cache,
        rules: ExclusionRules::new(&ExclusionConfig::default()).unwrap(),
        blacklist: TmpBlacklist::new(Duration::from_secs(60)),
        events: MemoryErrorSink::new(),
    }
}

fn local_file(id: &str, parent: &str, name: &str) -> SnapshotItem {
    SnapshotItem::file(id, parent, name).with_times(100, 200).with_size(5)
}

fn paths(ops: &FsOperationSet, op_type: OperationType) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = ops.of_type(op_type).map(|op| op.path.clone()).collect();
    out.sort();
    out
}

// ── Deletes ──────────────────────────────────────────────────────

#[test]
fn deleted_directory_yields_one_delete_per_node() {
    let f = make_fixture();
    let docs = f.insert(f.root(), "docs", NodeType::Directory, ("l1", "r1"));
    f.insert(docs, "a.txt", NodeType::File, ("l2", "r2"));
    f.insert(docs, "b.txt", NodeType::File, ("l3", "r3"));
    let sub = f.insert(docs, "sub", NodeType::Directory, ("l4", "r4"));
    f.insert(sub, "c.txt", NodeType::File, ("l5", "r5"));

    let local = Snapshot::new(ReplicaSide::Local, "l0");
    let ops = f.detect(&local);

    assert_eq!(ops.len(), 5);
    assert_eq!(
        paths(&ops, OperationType::Delete),
        vec![
            PathBuf::from("docs"),
            PathBuf::from("docs/a.txt"),
            PathBuf::from("docs/b.txt"),
            PathBuf::from("docs/sub"),
            PathBuf::from("docs/sub/c.txt"),
        ]
    );
    let delete = ops.op(&NodeId::from("l5"), OperationType::Delete).unwrap();
    assert_eq!(delete.node_type, NodeType::File);
    assert!(delete.db_id.is_some());
}

#[test]
fn child_moved_out_of_deleted_directory_is_a_move() {
    let f = make_fixture();
    let docs = f.insert(f.root(), "docs", NodeType::Directory, ("l1", "r1"));
    f.insert(docs, "a.txt", NodeType::File, ("l2", "r2"));

    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(local_file("l2", "l0", "a.txt")).unwrap();
    let ops = f.detect(&local);

    assert_eq!(paths(&ops, OperationType::Delete), vec![PathBuf::from("docs")]);
    let moved = ops.op(&NodeId::from("l2"), OperationType::Move).unwrap();
    assert_eq!(moved.path, Path::new("a.txt"));
    assert_eq!(moved.origin_path.as_deref(), Some(Path::new("docs/a.txt")));
}

// ── Moves and edits ──────────────────────────────────────────────

#[test]
fn rename_is_a_move_not_a_delete_and_create() {
    let f = make_fixture();
    f.insert(f.root(), "old.txt", NodeType::File, ("l1", "r1"));

    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(local_file("l1", "l0", "new.txt")).unwrap();
    let ops = f.detect(&local);

    assert_eq!(ops.len(), 1);
    assert_eq!(ops.count(OperationType::Move), 1);
    assert_eq!(ops.count(OperationType::Delete), 0);
    assert_eq!(ops.count(OperationType::Create), 0);
}

#[test]
fn unicode_form_change_alone_is_not_a_move() {
    let f = make_fixture();
    f.insert(f.root(), "caf\u{e9}.txt", NodeType::File, ("l1", "r1"));

    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local
        .update_item(local_file("l1", "l0", "cafe\u{301}.txt"))
        .unwrap();
    assert!(f.detect(&local).is_empty());
}

#[test]
fn mtime_or_size_change_is_an_edit() {
    let f = make_fixture();
    f.insert(f.root(), "a.txt", NodeType::File, ("l1", "r1"));
    f.insert(f.root(), "b.txt", NodeType::File, ("l2", "r2"));
    f.insert(f.root(), "c.txt", NodeType::File, ("l3", "r3"));

    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local
        .update_item(SnapshotItem::file("l1", "l0", "a.txt").with_times(100, 250).with_size(5))
        .unwrap();
    local
        .update_item(SnapshotItem::file("l2", "l0", "b.txt").with_times(100, 200).with_size(9))
        .unwrap();
    local.update_item(local_file("l3", "l0", "c.txt")).unwrap();
    let ops = f.detect(&local);

    assert_eq!(
        paths(&ops, OperationType::Edit),
        vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]
    );
    assert_eq!(ops.len(), 2);
}

#[test]
fn remote_side_compares_remote_mtime() {
    let f = make_fixture();
    f.insert(f.root(), "a.txt", NodeType::File, ("l1", "r1"));

    let mut remote = Snapshot::new(ReplicaSide::Remote, "r0");
    remote
        .update_item(SnapshotItem::file("r1", "r0", "a.txt").with_times(100, 300).with_size(5))
        .unwrap();
    assert!(f.detect(&remote).is_empty());
}

// ── Creates ──────────────────────────────────────────────────────

#[test]
fn creates_come_parent_first_and_are_stable() {
    let f = make_fixture();
    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(SnapshotItem::directory("l1", "l0", "new")).unwrap();
    local.update_item(local_file("l2", "l1", "inner.txt")).unwrap();

    let first = f.detect(&local);
    let order: Vec<&Path> = first
        .of_type(OperationType::Create)
        .map(|op| op.path.as_path())
        .collect();
    assert_eq!(order, vec![Path::new("new"), Path::new("new/inner.txt")]);

    let second = f.detect(&local);
    assert_eq!(first.len(), second.len());
    assert_eq!(paths(&first, OperationType::Create), paths(&second, OperationType::Create));
}

#[test]
fn nothing_is_created_once_persisted() {
    let f = make_fixture();
    f.insert(f.root(), "a.txt", NodeType::File, ("l1", "r1"));
    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(local_file("l1", "l0", "a.txt")).unwrap();
    assert!(f.detect(&local).is_empty());
}

#[test]
fn rescue_folder_is_not_synced() {
    let f = make_fixture();
    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(SnapshotItem::directory("l1", "l0", RESCUE)).unwrap();
    local.update_item(local_file("l2", "l1", "saved.txt")).unwrap();
    assert!(f.detect(&local).is_empty());
}

#[test]
fn excluded_create_is_reported() {
    let f = make_fixture();
    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(local_file("l1", "l0", "scratch.tmp")).unwrap();

    let ops = f.detect(&local);
    assert!(ops.is_empty());
    assert_eq!(f.events.count(EventCause::Excluded), 1);
}

#[test]
fn blacklisted_items_are_skipped_silently() {
    let f = make_fixture();
    f.blacklist
        .blacklist_item(ReplicaSide::Local, &NodeId::from("l1"), Path::new("stuck.bin"));
    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(local_file("l1", "l0", "stuck.bin")).unwrap();

    assert!(f.detect(&local).is_empty());
    assert_eq!(f.events.count(EventCause::Excluded), 0);
}
