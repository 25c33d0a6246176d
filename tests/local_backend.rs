use std::fs;
use std::path::Path;
use std::sync::Arc;

use ferry::backends::LocalBackend;
use ferry::core::{
    ExecutionOptions, Item, TransferEngine, TransferMode, TransferRequest, TransferSummary,
};
use filetime::FileTime;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// `photos/{a.jpg, 2024/{b.jpg, c.jpg}}` plus a loose `notes.txt`.
fn populate(root: &Path) {
    fs::create_dir_all(root.join("photos/2024")).unwrap();
    fs::write(root.join("photos/a.jpg"), vec![1u8; 300_000]).unwrap();
    fs::write(root.join("photos/2024/b.jpg"), b"bbbb").unwrap();
    fs::write(root.join("photos/2024/c.jpg"), b"").unwrap();
    fs::write(root.join("notes.txt"), b"remember the milk").unwrap();
}

async fn run(
    source: &Arc<LocalBackend>,
    target: &Arc<LocalBackend>,
    mode: TransferMode,
    entries: &[&str],
    keep_existing: bool,
) -> TransferSummary {
    run_with(source, target, mode, entries, keep_existing, ExecutionOptions::default()).await
}

async fn run_with(
    source: &Arc<LocalBackend>,
    target: &Arc<LocalBackend>,
    mode: TransferMode,
    entries: &[&str],
    keep_existing: bool,
    options: ExecutionOptions,
) -> TransferSummary {
    let mut items: Vec<Item> = Vec::new();
    for entry in entries {
        items.push(source.item(&LocalBackend::id_for(entry)).await.unwrap());
    }
    let engine = TransferEngine::new(source.clone(), target.clone(), options);
    let request = TransferRequest {
        mode,
        items,
        target_dir: LocalBackend::root_id(),
        keep_existing,
    };
    engine.run(&request, &CancellationToken::new()).await.unwrap()
}

fn roots() -> (TempDir, TempDir, Arc<LocalBackend>, Arc<LocalBackend>) {
    let from = tempfile::tempdir().unwrap();
    let to = tempfile::tempdir().unwrap();
    let source = Arc::new(LocalBackend::new(from.path()));
    let target = Arc::new(LocalBackend::new(to.path()));
    (from, to, source, target)
}

fn leftovers(dir: &Path) -> Vec<String> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".ferry-partial") {
            found.push(name);
        }
        if entry.file_type().unwrap().is_dir() {
            found.extend(leftovers(&entry.path()));
        }
    }
    found
}

#[tokio::test]
async fn copies_a_tree_between_roots() {
    let (from, to, source, target) = roots();
    populate(from.path());

    let summary = run(&source, &target, TransferMode::Copy, &["photos", "notes.txt"], false).await;

    assert_eq!(summary.files, 4);
    assert_eq!(summary.directories, 2);
    assert_eq!(summary.direct, 0);
    assert_eq!(summary.bytes, 300_000 + 4 + 17);
    assert_eq!(fs::read(to.path().join("photos/a.jpg")).unwrap(), vec![1u8; 300_000]);
    assert_eq!(fs::read(to.path().join("photos/2024/b.jpg")).unwrap(), b"bbbb");
    assert!(to.path().join("photos/2024/c.jpg").is_file());
    assert!(leftovers(to.path()).is_empty());
    assert!(from.path().join("photos/a.jpg").exists());
}

#[tokio::test]
async fn modification_times_survive_streaming() {
    let (from, to, source, target) = roots();
    populate(from.path());
    let stamp = FileTime::from_unix_time(1_600_000_000, 0);
    filetime::set_file_mtime(from.path().join("notes.txt"), stamp).unwrap();

    run(&source, &target, TransferMode::Copy, &["notes.txt"], false).await;

    let meta = fs::metadata(to.path().join("notes.txt")).unwrap();
    assert_eq!(FileTime::from_last_modification_time(&meta), stamp);
}

#[tokio::test]
async fn move_between_roots_empties_the_source() {
    let (from, to, source, target) = roots();
    populate(from.path());

    let summary = run(&source, &target, TransferMode::Move, &["photos"], false).await;

    assert_eq!(summary.files, 3);
    assert_eq!(summary.removed_sources, 5);
    assert!(!from.path().join("photos").exists());
    assert!(from.path().join("notes.txt").exists());
    assert_eq!(fs::read(to.path().join("photos/2024/b.jpg")).unwrap(), b"bbbb");
}

#[tokio::test]
async fn same_root_uses_native_operations() {
    let root = tempfile::tempdir().unwrap();
    populate(root.path());
    fs::create_dir(root.path().join("archive")).unwrap();
    let backend = Arc::new(LocalBackend::new(root.path()));
    let engine = TransferEngine::new(backend.clone(), backend.clone(), ExecutionOptions::default());

    let copy = TransferRequest {
        mode: TransferMode::Copy,
        items: vec![backend.item(&LocalBackend::id_for("photos")).await.unwrap()],
        target_dir: LocalBackend::id_for("archive"),
        keep_existing: false,
    };
    let summary = engine.run(&copy, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.direct, 1);
    assert_eq!(fs::read(root.path().join("archive/photos/2024/b.jpg")).unwrap(), b"bbbb");
    assert!(root.path().join("photos").exists());

    let relocate = TransferRequest {
        mode: TransferMode::Move,
        items: vec![backend.item(&LocalBackend::id_for("notes.txt")).await.unwrap()],
        target_dir: LocalBackend::id_for("archive"),
        keep_existing: false,
    };
    let summary = engine.run(&relocate, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.direct, 1);
    assert!(!root.path().join("notes.txt").exists());
    assert!(root.path().join("archive/notes.txt").is_file());
}

#[tokio::test]
async fn second_keep_existing_run_is_a_no_op() {
    let (from, to, source, target) = roots();
    populate(from.path());

    let first = run(&source, &target, TransferMode::Copy, &["photos"], true).await;
    assert_eq!(first.files, 3);

    let second = run(&source, &target, TransferMode::Copy, &["photos"], true).await;
    assert_eq!(second.files, 0);
    assert_eq!(second.directories, 0);

    let mut names: Vec<String> = fs::read_dir(to.path().join("photos"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["2024", "a.jpg"]);
}

#[tokio::test]
async fn taken_names_are_numbered_on_disk() {
    let (from, to, source, target) = roots();
    populate(from.path());
    fs::write(to.path().join("notes.txt"), b"old").unwrap();

    run(&source, &target, TransferMode::Copy, &["notes.txt"], false).await;

    assert_eq!(fs::read(to.path().join("notes.txt")).unwrap(), b"old");
    assert_eq!(
        fs::read(to.path().join("notes (1).txt")).unwrap(),
        b"remember the milk"
    );
}

#[tokio::test]
async fn kept_backup_is_found_by_a_later_run() {
    let (from, to, source, target) = roots();
    let cache = tempfile::tempdir().unwrap();
    fs::write(from.path().join("big.bin"), vec![7u8; 50_000]).unwrap();
    let options = ExecutionOptions {
        backup_threshold: 0,
        cache_dir: Some(cache.path().to_path_buf()),
        keep_backups: true,
        ..ExecutionOptions::default()
    };

    run_with(&source, &target, TransferMode::Copy, &["big.bin"], false, options.clone()).await;
    assert_eq!(fs::read_dir(cache.path()).unwrap().count(), 1);

    // Same size, new bytes: only the kept backup still holds the old ones.
    fs::write(from.path().join("big.bin"), vec![9u8; 50_000]).unwrap();
    fs::remove_file(to.path().join("big.bin")).unwrap();
    let later = Arc::new(LocalBackend::new(from.path()));
    run_with(&later, &target, TransferMode::Copy, &["big.bin"], false, options).await;

    assert_eq!(fs::read(to.path().join("big.bin")).unwrap(), vec![7u8; 50_000]);
}
