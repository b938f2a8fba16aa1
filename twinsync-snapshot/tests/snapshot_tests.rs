use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use twinsync_snapshot::{Snapshot, SnapshotError, SnapshotItem};
use twinsync_types::{NodeId, ReplicaSide, SyncName};

fn id(s: &str) -> NodeId {
    NodeId::from(s)
}

/// root ── A ── AA ── AAA (file)
///      │    └─ AB
///      └─ b.txt
fn make_tree() -> Snapshot {
    let mut s = Snapshot::new(ReplicaSide::Local, "root");
    s.update_item(SnapshotItem::directory("a", "root", "A")).unwrap();
    s.update_item(SnapshotItem::directory("aa", "a", "AA")).unwrap();
    s.update_item(SnapshotItem::file("aaa", "aa", "AAA").with_size(10)).unwrap();
    s.update_item(SnapshotItem::directory("ab", "a", "AB")).unwrap();
    s.update_item(SnapshotItem::file("b", "root", "b.txt")).unwrap();
    s
}

// ── Construction ─────────────────────────────────────────────────

#[test]
fn new_snapshot_holds_only_root() {
    let s = Snapshot::new(ReplicaSide::Remote, "r0");
    assert_eq!(s.nb_items(), 1);
    assert_eq!(s.root_id(), &id("r0"));
    assert_eq!(s.side(), ReplicaSide::Remote);
    assert_eq!(s.path(&id("r0")).unwrap(), PathBuf::new());
    s.check_integrity_recursively().unwrap();
}

#[test]
fn update_links_children() {
    let s = make_tree();
    assert_eq!(s.nb_items(), 6);
    assert_eq!(s.children_ids(&id("a")), vec![id("aa"), id("ab")]);
    assert_eq!(s.children_ids(&id("root")), vec![id("a"), id("b")]);
    s.check_integrity_recursively().unwrap();
}

#[test]
fn revision_bumps_and_stamps_item() {
    let mut s = Snapshot::new(ReplicaSide::Local, "root");
    let before = s.revision();
    s.update_item(SnapshotItem::file("f", "root", "f")).unwrap();
    assert!(s.revision() > before);
    assert_eq!(s.item(&id("f")).unwrap().last_change_revision(), s.revision());
}

// ── Structural errors ────────────────────────────────────────────

#[test]
fn missing_parent_is_an_error() {
    let mut s = Snapshot::new(ReplicaSide::Local, "root");
    let err = s
        .update_item(SnapshotItem::file("f", "nowhere", "f"))
        .unwrap_err();
    assert!(matches!(err, SnapshotError::MissingParent { .. }));
    assert_eq!(s.nb_items(), 1);
}

#[test]
fn file_parent_is_an_error() {
    let mut s = make_tree();
    let err = s.update_item(SnapshotItem::file("x", "b", "x")).unwrap_err();
    assert!(matches!(err, SnapshotError::ParentNotDirectory { .. }));
}

#[test]
fn moving_under_own_descendant_is_a_cycle() {
    let mut s = make_tree();
    let err = s
        .update_item(SnapshotItem::directory("a", "aa", "A"))
        .unwrap_err();
    assert!(matches!(err, SnapshotError::Cycle { .. }));
    s.check_integrity_recursively().unwrap();
}

#[test]
fn root_cannot_be_removed_or_reparented() {
    let mut s = make_tree();
    assert_eq!(s.remove_item(&id("root")), Err(SnapshotError::RootRemoval));
    let err = s
        .update_item(SnapshotItem::directory("root", "a", ""))
        .unwrap_err();
    assert!(matches!(err, SnapshotError::RootWithParent(_)));
}

// ── Move & remove ────────────────────────────────────────────────

#[test]
fn reparenting_moves_the_subtree() {
    let mut s = make_tree();
    s.update_item(SnapshotItem::directory("aa", "root", "AA")).unwrap();
    assert_eq!(s.path(&id("aaa")).unwrap(), Path::new("AA/AAA"));
    assert_eq!(s.children_ids(&id("a")), vec![id("ab")]);
    s.check_integrity_recursively().unwrap();
}

#[test]
fn remove_drops_whole_subtree() {
    let mut s = make_tree();
    s.remove_item(&id("a")).unwrap();
    assert_eq!(s.nb_items(), 2);
    for gone in ["a", "aa", "aaa", "ab"] {
        assert!(!s.contains(&id(gone)));
    }
    s.check_integrity_recursively().unwrap();
}

#[test]
fn removed_ids_can_be_inserted_again() {
    let mut s = make_tree();
    s.remove_item(&id("a")).unwrap();
    assert!(s.item(&id("aaa")).is_none());

    s.update_item(SnapshotItem::file("aaa", "root", "AAA")).unwrap();
    assert_eq!(s.nb_items(), 3);
    assert_eq!(s.path(&id("aaa")).unwrap(), Path::new("AAA"));
    assert!(s.path(&id("aa")).is_err());
    s.check_integrity_recursively().unwrap();
}

#[test]
fn removed_slot_reuse_does_not_resurrect_old_children() {
    let mut s = make_tree();
    s.remove_item(&id("aa")).unwrap();
    // The freed slots are reused by new items.
    s.update_item(SnapshotItem::directory("n1", "root", "N1")).unwrap();
    s.update_item(SnapshotItem::directory("n2", "n1", "N2")).unwrap();
    assert!(s.children_ids(&id("n2")).is_empty());
    assert_eq!(s.children_ids(&id("a")), vec![id("ab")]);
    s.check_integrity_recursively().unwrap();
}

#[test]
fn remove_unknown_is_not_found() {
    let mut s = make_tree();
    assert_eq!(
        s.remove_item(&id("ghost")),
        Err(SnapshotError::NotFound(id("ghost")))
    );
}

// ── Paths ────────────────────────────────────────────────────────

#[test]
fn path_walks_to_root() {
    let s = make_tree();
    assert_eq!(s.path(&id("aaa")).unwrap(), Path::new("A/AA/AAA"));
    assert_eq!(s.id_by_path(Path::new("A/AA/AAA")), Some(&id("aaa")));
    assert_eq!(s.id_by_path(Path::new("A/missing")), None);
}

#[test]
fn drive_letter_component_is_ignored() {
    let mut s = Snapshot::new(ReplicaSide::Remote, "root");
    s.update_item(SnapshotItem::directory("d", "root", "C:")).unwrap();
    s.update_item(SnapshotItem::file("f", "d", "f")).unwrap();
    let err = s.path(&id("f")).unwrap_err();
    assert!(err.is_ignored());
}

#[test]
fn normalized_path_uses_canonical_names() {
    let mut s = Snapshot::new(ReplicaSide::Local, "root");
    s.update_item(SnapshotItem::file("f", "root", "e\u{0301}.txt")).unwrap();
    assert_eq!(s.normalized_path(&id("f")).unwrap(), Path::new("\u{e9}.txt"));
    assert_eq!(
        s.child_by_name(&id("root"), &SyncName::new("\u{e9}.txt")),
        Some(&id("f"))
    );
}

// ── Ancestry ─────────────────────────────────────────────────────

#[test]
fn is_ancestor_is_strict() {
    let s = make_tree();
    assert!(s.is_ancestor(&id("a"), &id("aaa")));
    assert!(s.is_ancestor(&id("root"), &id("ab")));
    assert!(!s.is_ancestor(&id("aaa"), &id("aaa")));
    assert!(!s.is_ancestor(&id("ab"), &id("aaa")));
}

#[test]
fn descendants_are_parent_first() {
    let s = make_tree();
    assert_eq!(
        s.descendants(&id("a")),
        vec![id("aa"), id("aaa"), id("ab")]
    );
}

// ── Frozen copies ────────────────────────────────────────────────

#[test]
fn frozen_copy_rejects_mutation() {
    let s = make_tree();
    let mut copy = s.frozen_copy();
    assert!(copy.is_frozen());
    assert_eq!(copy.revision(), s.revision());
    assert_eq!(
        copy.update_item(SnapshotItem::file("z", "root", "z")),
        Err(SnapshotError::Frozen)
    );
    assert_eq!(copy.remove_item(&id("a")), Err(SnapshotError::Frozen));
}

#[test]
fn frozen_copy_is_independent_of_source() {
    let mut s = make_tree();
    let copy = s.frozen_copy();
    assert_eq!(copy.path(&id("aaa")).unwrap(), Path::new("A/AA/AAA"));
    s.update_item(SnapshotItem::directory("aa", "root", "AA")).unwrap();
    // cached path on the copy is still right for the copy's generation
    assert_eq!(copy.path(&id("aaa")).unwrap(), Path::new("A/AA/AAA"));
    assert_eq!(s.path(&id("aaa")).unwrap(), Path::new("AA/AAA"));
}
