use pretty_assertions::assert_eq;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use twinsync_sync::naming::{conflict_name, numbered_name, split_extension};
use twinsync_sync::{EventCause, FileRescuer, JobError, MemoryErrorSink};
use twinsync_types::{NodeId, ReplicaSide};

const RESCUE: &str = "Rescued Files";

fn make_rescuer() -> (TempDir, FileRescuer, Arc<MemoryErrorSink>) {
    let dir = TempDir::new().unwrap();
    let events = Arc::new(MemoryErrorSink::new());
    let rescuer = FileRescuer::new(dir.path(), RESCUE, events.clone());
    (dir, rescuer, events)
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

// ── Naming ───────────────────────────────────────────────────────

#[test]
fn extensions_split_on_the_last_dot() {
    assert_eq!(split_extension("archive.tar.gz", false), ("archive.tar", ".gz"));
    assert_eq!(split_extension(".bashrc", false), (".bashrc", ""));
    assert_eq!(split_extension("v1.2", true), ("v1.2", ""));
}

#[test]
fn numbered_names_keep_the_extension() {
    assert_eq!(numbered_name("report.pdf", 0, false), "report.pdf");
    assert_eq!(numbered_name("report.pdf", 1, false), "report (1).pdf");
    assert_eq!(numbered_name("my.photos", 2, true), "my.photos (2)");
}

#[test]
fn conflict_names_are_unique() {
    let a = conflict_name("report.pdf", "_conflict_", false);
    let b = conflict_name("report.pdf", "_conflict_", false);
    assert!(a.as_str().starts_with("report_conflict_"));
    assert!(a.as_str().ends_with(".pdf"));
    assert_ne!(a, b);
}

// ── Rescue ───────────────────────────────────────────────────────

#[tokio::test]
async fn rescue_moves_into_the_rescue_folder() {
    let (dir, rescuer, events) = make_rescuer();
    write(dir.path(), "docs/report.txt", "draft");

    let dest = rescuer
        .rescue(Path::new("docs/report.txt"), ReplicaSide::Local, Some(&NodeId::from("l7")))
        .await
        .unwrap();

    assert_eq!(dest, PathBuf::from(RESCUE).join("report.txt"));
    assert!(!dir.path().join("docs/report.txt").exists());
    assert_eq!(fs::read_to_string(dir.path().join(&dest)).unwrap(), "draft");

    let reported = events.events();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].cause, EventCause::Rescued);
    assert_eq!(reported[0].dest_path.as_deref(), Some(dest.as_path()));
    assert_eq!(reported[0].node_id, Some(NodeId::from("l7")));
}

#[tokio::test]
async fn second_rescue_of_the_same_name_is_numbered() {
    let (dir, rescuer, events) = make_rescuer();
    write(dir.path(), "a/report.txt", "first");
    write(dir.path(), "b/report.txt", "second");

    let first = rescuer
        .rescue(Path::new("a/report.txt"), ReplicaSide::Local, None)
        .await
        .unwrap();
    let second = rescuer
        .rescue(Path::new("b/report.txt"), ReplicaSide::Local, None)
        .await
        .unwrap();

    assert_eq!(first, Path::new(RESCUE).join("report.txt"));
    assert_eq!(second, Path::new(RESCUE).join("report (1).txt"));
    assert_eq!(fs::read_to_string(dir.path().join(&first)).unwrap(), "first");
    assert_eq!(fs::read_to_string(dir.path().join(&second)).unwrap(), "second");
    assert_eq!(events.count(EventCause::Rescued), 2);
}

#[tokio::test]
async fn directories_are_rescued_whole() {
    let (dir, rescuer, _events) = make_rescuer();
    write(dir.path(), "my.photos/a.jpg", "a");
    write(dir.path(), "old/my.photos/b.jpg", "b");

    rescuer.rescue(Path::new("my.photos"), ReplicaSide::Local, None).await.unwrap();
    let second = rescuer
        .rescue(Path::new("old/my.photos"), ReplicaSide::Local, None)
        .await
        .unwrap();

    assert_eq!(second, Path::new(RESCUE).join("my.photos (1)"));
    assert!(dir.path().join(RESCUE).join("my.photos/a.jpg").is_file());
    assert!(dir.path().join(&second).join("b.jpg").is_file());
}

#[tokio::test]
async fn missing_source_is_not_found() {
    let (_dir, rescuer, events) = make_rescuer();
    let err = rescuer
        .rescue(Path::new("gone.txt"), ReplicaSide::Local, None)
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::NotFound(_)));
    assert!(events.events().is_empty());
}
