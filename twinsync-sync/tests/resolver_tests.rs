use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use twinsync_snapshot::{Snapshot, SnapshotItem};
use twinsync_store::{NodeCache, NodeStore, PersistedNode};
use twinsync_sync::{
    ChangeDetector, ConflictFinder, ConflictResolver, EventCause, ExclusionRules,
    MemoryErrorSink, NodeRef, Resolution, SyncConfig, SyncOperation, SyncOperationList,
    TmpBlacklist, link_dependencies,
};
use twinsync_types::{
    ConflictType, DbNodeId, NodeId, NodeType, OperationType, ReplicaSide, SyncName,
};

struct Fixture {
    store: Arc<NodeStore>,
    cache: NodeCache,
    config: SyncConfig,
    rules: ExclusionRules,
    blacklist: TmpBlacklist,
    events: MemoryErrorSink,
}

fn make_fixture() -> Fixture {
    let store =
        Arc::new(NodeStore::open_in_memory(&NodeId::from("l0"), &NodeId::from("r0")).unwrap());
    let cache = NodeCache::new(Arc::clone(&store));
    let config = SyncConfig::default();
    Fixture {
        store,
        cache,
        rules: ExclusionRules::new(&config.exclusion).unwrap(),
        config,
        blacklist: TmpBlacklist::new(Duration::from_secs(60)),
        events: MemoryErrorSink::new(),
    }
}

impl Fixture {
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
            .with_times(100, 200, 200)
            .with_size(if node_type.is_dir() { 0 } else { 5 });
        self.store.insert_node(&node).unwrap()
    }

    fn resolve(&self, local: &Snapshot, remote: &Snapshot) -> Resolution {
        let detector = ChangeDetector::new(
            &self.cache,
            &self.rules,
            &self.blacklist,
            &self.config.rescue_folder_name,
        );
        let local_ops = detector.detect(local).unwrap();
        let remote_ops = detector.detect(remote).unwrap();
        let conflicts = ConflictFinder::new(&self.cache, &local_ops, &remote_ops, local, remote)
            .find()
            .unwrap();
        ConflictResolver::new(
            &self.cache,
            &self.config,
            &self.events,
            (local, remote),
            (&local_ops, &remote_ops),
        )
        .resolve(&conflicts)
        .unwrap()
    }
}

fn file(id: &str, parent: &str, name: &str, mtime: i64, size: u64) -> SnapshotItem {
    SnapshotItem::file(id, parent, name).with_times(100, mtime).with_size(size)
}

fn only_op(resolution: &Resolution) -> &SyncOperation {
    assert_eq!(resolution.ops.len(), 1, "{:#?}", resolution.ops);
    resolution.ops.iter().next().unwrap()
}

// ── Propagation ──────────────────────────────────────────────────

#[test]
fn unconflicted_changes_are_replayed_on_the_other_side() {
    let f = make_fixture();
    f.insert(f.root(), "a.txt", NodeType::File, ("l1", "r1"));

    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(file("l1", "l0", "a.txt", 500, 5)).unwrap();
    local.update_item(file("l2", "l0", "b.txt", 500, 3)).unwrap();
    let mut remote = Snapshot::new(ReplicaSide::Remote, "r0");
    remote.update_item(file("r1", "r0", "a.txt", 200, 5)).unwrap();

    let resolution = f.resolve(&local, &remote);
    assert!(!resolution.needs_restart);
    assert_eq!(resolution.conflicts_resolved, 0);

    let kinds: Vec<(OperationType, ReplicaSide)> = resolution
        .ops
        .iter()
        .map(|op| (op.op_type, op.target_side))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (OperationType::Create, ReplicaSide::Remote),
            (OperationType::Edit, ReplicaSide::Remote),
        ]
    );
    let edit = resolution.ops.iter().find(|op| op.op_type == OperationType::Edit).unwrap();
    assert_eq!(edit.corresponding.as_ref().unwrap().id, NodeId::from("r1"));
}

#[test]
fn move_into_a_new_directory_waits_for_its_create() {
    let f = make_fixture();
    let old = f.insert(f.root(), "D", NodeType::Directory, ("l1", "r1"));
    f.insert(old, "f.txt", NodeType::File, ("l2", "r2"));

    // Locally: mkdir N; mv D/f.txt N/f.txt; rm -r D
    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(SnapshotItem::directory("l3", "l0", "N")).unwrap();
    local.update_item(file("l2", "l3", "f.txt", 200, 5)).unwrap();
    let mut remote = Snapshot::new(ReplicaSide::Remote, "r0");
    remote.update_item(SnapshotItem::directory("r1", "r0", "D")).unwrap();
    remote.update_item(file("r2", "r1", "f.txt", 200, 5)).unwrap();

    let resolution = f.resolve(&local, &remote);
    assert_eq!(resolution.ops.len(), 3, "{:#?}", resolution.ops);
    let find = |op_type: OperationType| {
        resolution
            .ops
            .iter()
            .find(|op| op.op_type == op_type)
            .unwrap()
    };
    let create = find(OperationType::Create);
    let moved = find(OperationType::Move);
    let delete = find(OperationType::Delete);

    assert_eq!(create.affected.id, NodeId::from("l3"));
    assert_eq!(moved.affected.id, NodeId::from("l2"));
    assert_eq!(moved.corresponding.as_ref().unwrap().id, NodeId::from("r2"));
    assert_eq!(delete.affected.path, Path::new("D"));
    assert_eq!(moved.depends_on, vec![create.id]);
    assert_eq!(delete.depends_on, vec![moved.id]);
}

#[test]
fn deleted_tree_is_replayed_as_one_delete() {
    let f = make_fixture();
    let docs = f.insert(f.root(), "docs", NodeType::Directory, ("l1", "r1"));
    f.insert(docs, "a.txt", NodeType::File, ("l2", "r2"));

    let local = Snapshot::new(ReplicaSide::Local, "l0");
    let mut remote = Snapshot::new(ReplicaSide::Remote, "r0");
    remote.update_item(SnapshotItem::directory("r1", "r0", "docs")).unwrap();
    remote.update_item(file("r2", "r1", "a.txt", 200, 5)).unwrap();

    let op = only_op(&f.resolve(&local, &remote)).clone();
    assert_eq!(op.op_type, OperationType::Delete);
    assert_eq!(op.target_side, ReplicaSide::Remote);
    assert_eq!(op.affected.path, Path::new("docs"));
}

#[test]
fn double_delete_only_touches_the_store() {
    let f = make_fixture();
    f.insert(f.root(), "a.txt", NodeType::File, ("l1", "r1"));

    let resolution = f.resolve(
        &Snapshot::new(ReplicaSide::Local, "l0"),
        &Snapshot::new(ReplicaSide::Remote, "r0"),
    );
    let op = only_op(&resolution);
    assert_eq!(op.op_type, OperationType::Delete);
    assert!(op.omit);
}

// ── Delete family ────────────────────────────────────────────────

#[test]
fn local_edit_against_remote_delete_is_rescued() {
    let f = make_fixture();
    f.insert(f.root(), "a.txt", NodeType::File, ("l1", "r1"));

    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(file("l1", "l0", "a.txt", 500, 7)).unwrap();
    let remote = Snapshot::new(ReplicaSide::Remote, "r0");

    let resolution = f.resolve(&local, &remote);
    assert!(resolution.needs_restart);
    assert_eq!(resolution.conflicts_resolved, 1);

    let op = only_op(&resolution);
    assert_eq!(op.op_type, OperationType::Move);
    assert_eq!(op.target_side, ReplicaSide::Local);
    assert!(op.is_rescue);
    assert!(op.forget_db);
    assert_eq!(op.origin_path.as_deref(), Some(Path::new("a.txt")));
    assert_eq!(op.conflict.as_ref().unwrap().conflict_type, ConflictType::EditDelete);

    assert_eq!(f.events.count(EventCause::Conflict), 1);
    let event = &f.events.events()[0];
    assert_eq!(event.conflict, Some(ConflictType::EditDelete));
    assert_eq!(event.path, PathBuf::from("a.txt"));
}

#[test]
fn remote_edit_against_local_delete_is_rescued_before_the_delete() {
    let f = make_fixture();
    f.insert(f.root(), "a.txt", NodeType::File, ("l1", "r1"));

    let local = Snapshot::new(ReplicaSide::Local, "l0");
    let mut remote = Snapshot::new(ReplicaSide::Remote, "r0");
    remote.update_item(file("r1", "r0", "a.txt", 500, 7)).unwrap();

    let resolution = f.resolve(&local, &remote);
    assert!(resolution.needs_restart);
    assert_eq!(resolution.ops.len(), 2, "{:#?}", resolution.ops);

    let rescue = resolution.ops.iter().find(|op| op.is_rescue).unwrap();
    assert_eq!(rescue.target_side, ReplicaSide::Local);
    assert_eq!(rescue.affected.side, ReplicaSide::Remote);
    assert_eq!(rescue.affected.id, NodeId::from("r1"));
    assert_eq!(rescue.origin_path.as_deref(), Some(Path::new("a.txt")));

    let delete = resolution
        .ops
        .iter()
        .find(|op| op.op_type == OperationType::Delete)
        .unwrap();
    assert_eq!(delete.target_side, ReplicaSide::Remote);
    assert_eq!(delete.depends_on, vec![rescue.id]);

    assert_eq!(f.events.count(EventCause::Conflict), 1);
    assert_eq!(f.events.count(EventCause::RemoteChangeDiscarded), 0);
}

#[test]
fn remote_move_against_local_delete_is_discarded() {
    let f = make_fixture();
    let docs = f.insert(f.root(), "docs", NodeType::Directory, ("l1", "r1"));
    f.insert(docs, "a.txt", NodeType::File, ("l2", "r2"));

    let local = Snapshot::new(ReplicaSide::Local, "l0");
    let mut remote = Snapshot::new(ReplicaSide::Remote, "r0");
    remote.update_item(SnapshotItem::directory("r1", "r0", "papers")).unwrap();
    remote.update_item(file("r2", "r1", "a.txt", 200, 5)).unwrap();

    let resolution = f.resolve(&local, &remote);
    assert!(resolution.ops.iter().all(|op| !op.is_rescue), "{:#?}", resolution.ops);
    assert!(
        resolution
            .ops
            .iter()
            .any(|op| op.op_type == OperationType::Delete && op.target_side == ReplicaSide::Remote)
    );
    assert_eq!(f.events.count(EventCause::RemoteChangeDiscarded), 1);
}

// ── Renames ──────────────────────────────────────────────────────

#[test]
fn create_create_renames_the_local_item() {
    let f = make_fixture();
    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(file("l1", "l0", "a.txt", 500, 3)).unwrap();
    let mut remote = Snapshot::new(ReplicaSide::Remote, "r0");
    remote.update_item(file("r1", "r0", "a.txt", 600, 9)).unwrap();

    let resolution = f.resolve(&local, &remote);
    let op = only_op(&resolution);
    assert_eq!(op.op_type, OperationType::Move);
    assert_eq!(op.target_side, ReplicaSide::Local);
    assert!(op.is_in_place());
    assert!(op.skip_db);
    assert_eq!(op.new_parent, Some(NodeId::from("l0")));

    let name = op.new_name.as_ref().unwrap().as_str();
    assert!(name.starts_with("a_conflict_"), "{name}");
    assert!(name.ends_with(".txt"), "{name}");
}

#[test]
fn identical_creates_are_store_only() {
    let f = make_fixture();
    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(file("l1", "l0", "a.txt", 500, 3)).unwrap();
    let mut remote = Snapshot::new(ReplicaSide::Remote, "r0");
    remote.update_item(file("r1", "r0", "a.txt", 500, 3)).unwrap();

    let resolution = f.resolve(&local, &remote);
    assert!(!resolution.needs_restart);
    let op = only_op(&resolution);
    assert_eq!(op.op_type, OperationType::Create);
    assert!(op.omit);
    assert_eq!(op.corresponding.as_ref().unwrap().id, NodeId::from("r1"));
    assert!(f.events.events().is_empty());
}

// ── Move cycles ──────────────────────────────────────────────────

#[test]
fn crossed_directory_moves_keep_only_the_remote_one() {
    let f = make_fixture();
    f.insert(f.root(), "A", NodeType::Directory, ("la", "ra"));
    f.insert(f.root(), "B", NodeType::Directory, ("lb", "rb"));

    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(SnapshotItem::directory("lb", "l0", "B")).unwrap();
    local.update_item(SnapshotItem::directory("la", "lb", "A")).unwrap();
    let mut remote = Snapshot::new(ReplicaSide::Remote, "r0");
    remote.update_item(SnapshotItem::directory("ra", "r0", "A")).unwrap();
    remote.update_item(SnapshotItem::directory("rb", "ra", "B")).unwrap();

    let resolution = f.resolve(&local, &remote);
    assert_eq!(resolution.ops.len(), 2);

    let undo = resolution.ops.iter().find(|op| op.is_breaking_cycle).unwrap();
    assert_eq!(undo.target_side, ReplicaSide::Local);
    assert_eq!(undo.affected.id, NodeId::from("la"));
    assert_eq!(undo.new_parent, Some(NodeId::from("l0")));
    assert_eq!(undo.new_name.as_ref().unwrap().as_str(), "A");

    let replay = resolution.ops.iter().find(|op| !op.is_breaking_cycle).unwrap();
    assert_eq!(replay.op_type, OperationType::Move);
    assert_eq!(replay.affected.id, NodeId::from("rb"));
    assert_eq!(replay.target_side, ReplicaSide::Local);
    assert!(replay.depends_on.contains(&undo.id));
}

// ── Dependencies ─────────────────────────────────────────────────

fn node_ref(side: ReplicaSide, id: &str, path: &str, node_type: NodeType) -> NodeRef {
    NodeRef {
        side,
        id: NodeId::from(id),
        path: PathBuf::from(path),
        node_type,
    }
}

#[test]
fn create_waits_for_its_parent_create() {
    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(SnapshotItem::directory("l1", "l0", "new")).unwrap();
    local.update_item(file("l2", "l1", "a.txt", 500, 3)).unwrap();
    let remote = Snapshot::new(ReplicaSide::Remote, "r0");

    let mut ops = SyncOperationList::new();
    let dir = ops.push(SyncOperation::new(
        OperationType::Create,
        ReplicaSide::Remote,
        node_ref(ReplicaSide::Local, "l1", "new", NodeType::Directory),
        None,
    ));
    let child = ops.push(SyncOperation::new(
        OperationType::Create,
        ReplicaSide::Remote,
        node_ref(ReplicaSide::Local, "l2", "new/a.txt", NodeType::File),
        None,
    ));
    link_dependencies(&mut ops, &local, &remote);

    assert!(ops.get(dir).unwrap().depends_on.is_empty());
    assert_eq!(ops.get(child).unwrap().depends_on, vec![dir]);
}

#[test]
fn delete_waits_for_moves_out_of_it() {
    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(file("l2", "l0", "a.txt", 200, 5)).unwrap();
    let remote = Snapshot::new(ReplicaSide::Remote, "r0");

    let mut ops = SyncOperationList::new();
    let mut moved = SyncOperation::new(
        OperationType::Move,
        ReplicaSide::Remote,
        node_ref(ReplicaSide::Local, "l2", "a.txt", NodeType::File),
        None,
    );
    moved.origin_path = Some(PathBuf::from("docs/a.txt"));
    let moved = ops.push(moved);
    let delete = ops.push(SyncOperation::new(
        OperationType::Delete,
        ReplicaSide::Remote,
        node_ref(ReplicaSide::Local, "l1", "docs", NodeType::Directory),
        None,
    ));
    link_dependencies(&mut ops, &local, &remote);

    assert_eq!(ops.get(delete).unwrap().depends_on, vec![moved]);
    assert!(ops.get(moved).unwrap().depends_on.is_empty());
}

#[test]
fn deletes_wait_for_rescues() {
    let local = Snapshot::new(ReplicaSide::Local, "l0");
    let remote = Snapshot::new(ReplicaSide::Remote, "r0");

    let mut ops = SyncOperationList::new();
    let mut rescue = SyncOperation::new(
        OperationType::Move,
        ReplicaSide::Local,
        node_ref(ReplicaSide::Local, "l5", "x/keep.txt", NodeType::File),
        None,
    );
    rescue.is_rescue = true;
    let rescue = ops.push(rescue);
    let mut download = SyncOperation::new(
        OperationType::Create,
        ReplicaSide::Local,
        node_ref(ReplicaSide::Remote, "r7", "y/edited.txt", NodeType::File),
        None,
    );
    download.is_rescue = true;
    let download = ops.push(download);
    let delete = ops.push(SyncOperation::new(
        OperationType::Delete,
        ReplicaSide::Local,
        node_ref(ReplicaSide::Remote, "r9", "other", NodeType::Directory),
        None,
    ));
    let remote_delete = ops.push(SyncOperation::new(
        OperationType::Delete,
        ReplicaSide::Remote,
        node_ref(ReplicaSide::Local, "l7", "y", NodeType::Directory),
        None,
    ));
    link_dependencies(&mut ops, &local, &remote);

    assert_eq!(ops.get(delete).unwrap().depends_on, vec![rescue, download]);
    assert_eq!(ops.get(remote_delete).unwrap().depends_on, vec![rescue, download]);
    assert!(ops.get(download).unwrap().depends_on.is_empty());
}
