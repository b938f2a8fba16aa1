use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use twinsync_snapshot::{Snapshot, SnapshotItem};
use twinsync_store::{NodeCache, NodeStore, PersistedNode};
use twinsync_sync::{
    ChangeDetector, Conflict, ConflictFinder, ConflictNode, ExclusionConfig, ExclusionRules,
    Relation, TmpBlacklist, classify,
};
use twinsync_types::{
    ConflictType, DbNodeId, NodeId, NodeType, OperationType, ReplicaSide, SyncName,
};

use OperationType::{Create, Delete, Edit, Move};

// ── classify ─────────────────────────────────────────────────────

#[test]
fn classify_same_node_pairs() {
    assert_eq!(classify(Edit, Edit, Relation::SameNode), Some(ConflictType::EditEdit));
    assert_eq!(classify(Edit, Delete, Relation::SameNode), Some(ConflictType::EditDelete));
    assert_eq!(classify(Delete, Edit, Relation::SameNode), Some(ConflictType::EditDelete));
    assert_eq!(classify(Delete, Move, Relation::SameNode), Some(ConflictType::MoveDelete));
    assert_eq!(classify(Move, Move, Relation::SameNode), Some(ConflictType::MoveMoveSource));
    assert_eq!(classify(Edit, Move, Relation::SameNode), None);
    assert_eq!(classify(Delete, Delete, Relation::SameNode), None);
}

#[test]
fn classify_other_relations() {
    assert_eq!(classify(Create, Create, Relation::SamePath), Some(ConflictType::CreateCreate));
    assert_eq!(classify(Create, Move, Relation::SamePath), Some(ConflictType::MoveCreate));
    assert_eq!(classify(Move, Move, Relation::SamePath), Some(ConflictType::MoveMoveDest));
    assert_eq!(
        classify(Delete, Create, Relation::UnderDeletedParent),
        Some(ConflictType::CreateParentDelete)
    );
    assert_eq!(
        classify(Move, Delete, Relation::UnderDeletedParent),
        Some(ConflictType::MoveParentDelete)
    );
    assert_eq!(classify(Move, Move, Relation::CrossedMoves), Some(ConflictType::MoveMoveCycle));
    assert_eq!(classify(Edit, Edit, Relation::CrossedMoves), None);
}

#[test]
fn classify_is_pure() {
    let relations = [
        Relation::SameNode,
        Relation::SamePath,
        Relation::UnderDeletedParent,
        Relation::CrossedMoves,
    ];
    for relation in relations {
        for a in [Create, Delete, Move, Edit] {
            for b in [Create, Delete, Move, Edit] {
                assert_eq!(classify(a, b, relation), classify(a, b, relation));
                assert_eq!(classify(a, b, relation), classify(b, a, relation));
            }
        }
    }
}

// ── Ordering ─────────────────────────────────────────────────────

fn conflict_node(side: ReplicaSide, id: &str, op_type: OperationType, path: &str) -> ConflictNode {
    ConflictNode {
        side,
        id: NodeId::from(id),
        db_id: None,
        op_type,
        node_type: NodeType::File,
        path: PathBuf::from(path),
        origin_path: None,
    }
}

fn make_conflict(conflict_type: ConflictType, path: &str, ids: (&str, &str)) -> Conflict {
    Conflict {
        conflict_type,
        local: conflict_node(ReplicaSide::Local, ids.0, Edit, path),
        remote: conflict_node(ReplicaSide::Remote, ids.1, Edit, path),
        pseudo: false,
    }
}

#[test]
fn conflicts_sort_by_type_then_depth_then_path() {
    let mut conflicts = vec![
        make_conflict(ConflictType::EditEdit, "a/b/c.txt", ("l1", "r1")),
        make_conflict(ConflictType::EditEdit, "z.txt", ("l2", "r2")),
        make_conflict(ConflictType::CreateCreate, "y/y.txt", ("l3", "r3")),
        make_conflict(ConflictType::EditEdit, "a.txt", ("l4", "r4")),
    ];
    conflicts.sort();
    let order: Vec<&str> = conflicts.iter().map(|c| c.local.id.as_str()).collect();
    assert_eq!(order, vec!["l3", "l4", "l2", "l1"]);
}

#[test]
fn priority_path_of_delete_family_is_the_deleted_node() {
    let conflict = Conflict {
        conflict_type: ConflictType::EditDelete,
        local: conflict_node(ReplicaSide::Local, "l1", Edit, "new/place.txt"),
        remote: conflict_node(ReplicaSide::Remote, "r1", Delete, "old/place.txt"),
        pseudo: false,
    };
    assert_eq!(conflict.deleting_side(), Some(ReplicaSide::Remote));
    assert_eq!(conflict.priority_path(), Path::new("old/place.txt"));
}

// ── ConflictFinder ───────────────────────────────────────────────

struct Fixture {
    store: Arc<NodeStore>,
    cache: NodeCache,
    rules: ExclusionRules,
    blacklist: TmpBlacklist,
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

    fn find(&self, local: &Snapshot, remote: &Snapshot) -> Vec<Conflict> {
        let detector =
            ChangeDetector::new(&self.cache, &self.rules, &self.blacklist, "Rescued Files");
        let local_ops = detector.detect(local).unwrap();
        let remote_ops = detector.detect(remote).unwrap();
        ConflictFinder::new(&self.cache, &local_ops, &remote_ops, local, remote)
            .find()
            .unwrap()
    }
}

fn file(id: &str, parent: &str, name: &str, mtime: i64, size: u64) -> SnapshotItem {
    SnapshotItem::file(id, parent, name).with_times(100, mtime).with_size(size)
}

#[test]
fn edit_against_delete() {
    let f = make_fixture();
    f.insert(f.root(), "a.txt", NodeType::File, ("l1", "r1"));

    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(file("l1", "l0", "a.txt", 500, 7)).unwrap();
    let remote = Snapshot::new(ReplicaSide::Remote, "r0");

    let conflicts = f.find(&local, &remote);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::EditDelete);
    assert_eq!(conflicts[0].deleting_side(), Some(ReplicaSide::Remote));
    assert!(!conflicts[0].pseudo);
}

#[test]
fn identical_edits_are_a_pseudo_conflict() {
    let f = make_fixture();
    f.insert(f.root(), "a.txt", NodeType::File, ("l1", "r1"));

    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(file("l1", "l0", "a.txt", 500, 7)).unwrap();
    let mut remote = Snapshot::new(ReplicaSide::Remote, "r0");
    remote.update_item(file("r1", "r0", "a.txt", 500, 7)).unwrap();

    let conflicts = f.find(&local, &remote);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::EditEdit);
    assert!(conflicts[0].pseudo);
}

#[test]
fn same_directory_created_twice_is_a_pseudo_conflict() {
    let f = make_fixture();
    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(SnapshotItem::directory("l1", "l0", "Photos")).unwrap();
    let mut remote = Snapshot::new(ReplicaSide::Remote, "r0");
    remote.update_item(SnapshotItem::directory("r1", "r0", "Photos")).unwrap();

    let conflicts = f.find(&local, &remote);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::CreateCreate);
    assert!(conflicts[0].pseudo);
}

#[test]
fn create_under_remotely_deleted_directory() {
    let f = make_fixture();
    f.insert(f.root(), "docs", NodeType::Directory, ("l1", "r1"));

    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(SnapshotItem::directory("l1", "l0", "docs")).unwrap();
    local.update_item(file("l2", "l1", "new.txt", 500, 3)).unwrap();
    let remote = Snapshot::new(ReplicaSide::Remote, "r0");

    let conflicts = f.find(&local, &remote);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::CreateParentDelete);
    assert_eq!(conflicts[0].local.id, NodeId::from("l2"));
    assert_eq!(conflicts[0].remote.id, NodeId::from("r1"));
}

#[test]
fn directories_moved_into_each_other() {
    let f = make_fixture();
    f.insert(f.root(), "A", NodeType::Directory, ("la", "ra"));
    f.insert(f.root(), "B", NodeType::Directory, ("lb", "rb"));

    // Locally A goes under B; remotely B goes under A.
    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(SnapshotItem::directory("lb", "l0", "B")).unwrap();
    local.update_item(SnapshotItem::directory("la", "lb", "A")).unwrap();
    let mut remote = Snapshot::new(ReplicaSide::Remote, "r0");
    remote.update_item(SnapshotItem::directory("ra", "r0", "A")).unwrap();
    remote.update_item(SnapshotItem::directory("rb", "ra", "B")).unwrap();

    let conflicts = f.find(&local, &remote);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::MoveMoveCycle);
    assert_eq!(conflicts[0].local.id, NodeId::from("la"));
    assert_eq!(conflicts[0].remote.id, NodeId::from("rb"));
}

#[test]
fn both_sides_moving_to_the_same_place_is_pseudo() {
    let f = make_fixture();
    f.insert(f.root(), "a.txt", NodeType::File, ("l1", "r1"));

    let mut local = Snapshot::new(ReplicaSide::Local, "l0");
    local.update_item(file("l1", "l0", "b.txt", 200, 5)).unwrap();
    let mut remote = Snapshot::new(ReplicaSide::Remote, "r0");
    remote.update_item(file("r1", "r0", "b.txt", 200, 5)).unwrap();

    let conflicts = f.find(&local, &remote);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::MoveMoveSource);
    assert!(conflicts[0].pseudo);
}
