use std::sync::Arc;

use ferry::backends::MemoryBackend;
use ferry::core::cache::BackupCache;
use ferry::core::{
    ExecutionOptions, ItemId, StorageBackend, TransferEngine, TransferMode, TransferRequest,
    TransferStatus, TransferSummary,
};
use ferry::error::{DuplicateKind, FailureSummary};
use ferry::{Result, TransferError};
use tokio_util::sync::CancellationToken;

async fn transfer(
    source: &Arc<MemoryBackend>,
    target: &Arc<MemoryBackend>,
    mode: TransferMode,
    items: &[ItemId],
    target_dir: ItemId,
    options: ExecutionOptions,
) -> Result<TransferSummary> {
    let engine = TransferEngine::new(source.clone(), target.clone(), options);
    let request = TransferRequest {
        mode,
        items: items.iter().filter_map(|id| source.item(id)).collect(),
        target_dir,
        keep_existing: false,
    };
    engine.run(&request, &CancellationToken::new()).await
}

/// `/A/{x.txt, B/{y.txt}}`
fn sample_tree(backend: &MemoryBackend) -> ItemId {
    let a = backend.add_dir(&backend.root(), "A");
    backend.add_file(&a, "x.txt", b"xxx".to_vec());
    let b = backend.add_dir(&a, "B");
    backend.add_file(&b, "y.txt", b"yy".to_vec());
    a
}

#[tokio::test]
async fn stale_source_credentials_are_revalidated() {
    let source = Arc::new(MemoryBackend::new());
    let target = Arc::new(MemoryBackend::new());
    let file = source.add_file(&source.root(), "a.txt", b"payload".to_vec());
    source.deny_access(1);

    let summary = transfer(
        &source,
        &target,
        TransferMode::Copy,
        &[file],
        target.root(),
        ExecutionOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(summary.files, 1);
    assert_eq!(source.revalidations(), 1);
    let copied = target.resolve("a.txt").unwrap();
    assert_eq!(target.read(&copied).unwrap(), b"payload");
}

#[tokio::test]
async fn rejected_write_is_retried_once() {
    let source = Arc::new(MemoryBackend::new());
    let target = Arc::new(MemoryBackend::new());
    let file = source.add_file(&source.root(), "a.txt", b"payload".to_vec());
    target.deny_access(1);

    transfer(
        &source,
        &target,
        TransferMode::Copy,
        &[file],
        target.root(),
        ExecutionOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(target.revalidations(), 1);
    assert!(target.resolve("a.txt").is_some());
}

#[tokio::test]
async fn repeated_denial_fails_the_file() {
    let source = Arc::new(MemoryBackend::new());
    let target = Arc::new(MemoryBackend::new());
    let file = source.add_file(&source.root(), "a.txt", b"payload".to_vec());
    source.deny_access(2);

    let err = transfer(
        &source,
        &target,
        TransferMode::Copy,
        &[file],
        target.root(),
        ExecutionOptions::default(),
    )
    .await
    .unwrap_err();

    match err {
        TransferError::Aggregate(agg) => {
            assert_eq!(agg.failures.len(), 1);
            assert!(agg.failures[0].error.is_access_denied());
            assert_eq!(agg.user_message(), "The transfer failed (1 item(s))");
        }
        other => panic!("expected aggregate error, got {:?}", other),
    }
    assert_eq!(source.revalidations(), 1);
    assert!(target.child_names(&target.root()).is_empty());
}

#[tokio::test]
async fn failed_directory_skips_its_subtree() {
    let source = Arc::new(MemoryBackend::new());
    let target = Arc::new(MemoryBackend::new());
    let a = sample_tree(&source);
    target.fail_on("B");

    let err = transfer(
        &source,
        &target,
        TransferMode::Copy,
        &[a],
        target.root(),
        ExecutionOptions::default(),
    )
    .await
    .unwrap_err();

    let TransferError::Aggregate(agg) = err else {
        panic!("expected aggregate error");
    };
    assert_eq!(agg.failures.len(), 1);
    assert_eq!(agg.failures[0].label, "B");
    assert!(agg.failures[0].is_directory);
    assert_eq!(
        agg.classify(),
        FailureSummary::Generic {
            failed: 1,
            succeeded: 2
        }
    );
    assert!(target.resolve("A/x.txt").is_some());
    assert!(target.resolve("A/B").is_none());
}

#[tokio::test]
async fn move_between_backends_removes_sources() {
    let source = Arc::new(MemoryBackend::new());
    let target = Arc::new(MemoryBackend::new());
    let a = sample_tree(&source);

    let summary = transfer(
        &source,
        &target,
        TransferMode::Move,
        &[a],
        target.root(),
        ExecutionOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(summary.files, 2);
    assert_eq!(summary.directories, 2);
    assert_eq!(summary.removed_sources, 4);
    assert!(source.child_names(&source.root()).is_empty());
    let y = target.resolve("A/B/y.txt").unwrap();
    assert_eq!(target.read(&y).unwrap(), b"yy");
}

#[tokio::test]
async fn failed_move_keeps_the_source_directory() {
    let source = Arc::new(MemoryBackend::new());
    let target = Arc::new(MemoryBackend::new());
    let a = sample_tree(&source);
    target.fail_on("y.txt");

    let err = transfer(
        &source,
        &target,
        TransferMode::Move,
        &[a],
        target.root(),
        ExecutionOptions::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, TransferError::Aggregate(_)));
    assert!(source.resolve("A/x.txt").is_none());
    assert!(source.resolve("A/B/y.txt").is_some());
}

#[tokio::test]
async fn same_backend_move_is_native() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_native_ops(true);
    let a = sample_tree(&backend);
    let dest = backend.add_dir(&backend.root(), "dest");

    let summary = transfer(
        &backend,
        &backend,
        TransferMode::Move,
        &[a.clone()],
        dest,
        ExecutionOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(summary.direct, 1);
    assert_eq!(summary.files, 0);
    assert_eq!(summary.removed_sources, 0);
    assert_eq!(backend.child_names(&backend.root()), vec!["dest"]);
    assert_eq!(backend.resolve("dest/A"), Some(a));
    assert!(backend.resolve("dest/A/B/y.txt").is_some());
}

#[tokio::test]
async fn native_clashes_are_classified_by_kind() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_native_ops(true);
    let a = backend.add_dir(&backend.root(), "A");
    let x = backend.add_file(&backend.root(), "x.txt", b"x".to_vec());
    let dest = backend.add_dir(&backend.root(), "dest");
    backend.add_dir(&dest, "a");
    backend.add_file(&dest, "X.TXT", b"old".to_vec());

    let options = ExecutionOptions {
        rename_conflicts: false,
        ..ExecutionOptions::default()
    };

    let err = transfer(
        &backend,
        &backend,
        TransferMode::Copy,
        &[a.clone()],
        dest.clone(),
        options.clone(),
    )
    .await
    .unwrap_err();
    let TransferError::Aggregate(agg) = err else {
        panic!("expected aggregate error");
    };
    assert_eq!(agg.classify(), FailureSummary::Duplicate(DuplicateKind::Folder));

    let err = transfer(
        &backend,
        &backend,
        TransferMode::Copy,
        &[a, x],
        dest.clone(),
        options,
    )
    .await
    .unwrap_err();
    let TransferError::Aggregate(agg) = err else {
        panic!("expected aggregate error");
    };
    assert_eq!(agg.classify(), FailureSummary::Duplicate(DuplicateKind::Mixed));
    assert_eq!(backend.child_names(&dest), vec!["X.TXT", "a"]);
}

#[tokio::test]
async fn complete_backup_replaces_the_source_read() {
    let cache_dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemoryBackend::new());
    let target = Arc::new(MemoryBackend::new());
    let data = vec![42u8; 4096];
    let file = source.add_file(&source.root(), "big.bin", data.clone());

    let cache = BackupCache::new(cache_dir.path());
    let entry = cache.path_for(&source.cache_scope(), &file);
    std::fs::write(&entry, &data).unwrap();

    let options = ExecutionOptions {
        backup_threshold: 0,
        cache_dir: Some(cache_dir.path().to_path_buf()),
        ..ExecutionOptions::default()
    };
    transfer(&source, &target, TransferMode::Copy, &[file], target.root(), options)
        .await
        .unwrap();

    assert_eq!(source.source_reads(), 0);
    let copied = target.resolve("big.bin").unwrap();
    assert_eq!(target.read(&copied).unwrap(), data);
    assert!(!entry.exists());
}

#[tokio::test]
async fn backups_are_kept_on_request() {
    let cache_dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemoryBackend::new());
    let target = Arc::new(MemoryBackend::new());
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let file = source.add_file(&source.root(), "big.bin", data.clone());

    let options = ExecutionOptions {
        backup_threshold: 0,
        cache_dir: Some(cache_dir.path().to_path_buf()),
        keep_backups: true,
        ..ExecutionOptions::default()
    };
    transfer(&source, &target, TransferMode::Copy, &[file.clone()], target.root(), options)
        .await
        .unwrap();

    let entry = BackupCache::new(cache_dir.path()).path_for(&source.cache_scope(), &file);
    assert_eq!(std::fs::read(entry).unwrap(), data);
}

#[tokio::test]
async fn rejected_upload_keeps_the_complete_backup() {
    let cache_dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemoryBackend::new());
    let target = Arc::new(MemoryBackend::new());
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
    let file = source.add_file(&source.root(), "big.bin", data.clone());
    target.reject_upload("big.bin");
    let options = ExecutionOptions {
        backup_threshold: 0,
        cache_dir: Some(cache_dir.path().to_path_buf()),
        ..ExecutionOptions::default()
    };

    let err = transfer(
        &source,
        &target,
        TransferMode::Copy,
        &[file.clone()],
        target.root(),
        options.clone(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TransferError::Aggregate(_)));
    assert!(target.child_names(&target.root()).is_empty());
    let entry = BackupCache::new(cache_dir.path()).path_for(&source.cache_scope(), &file);
    assert_eq!(std::fs::read(&entry).unwrap(), data);

    // The retry is served from the kept entry.
    let reads = source.source_reads();
    transfer(&source, &target, TransferMode::Copy, &[file], target.root(), options)
        .await
        .unwrap();

    assert_eq!(source.source_reads(), reads);
    assert_eq!(target.child_names(&target.root()), vec!["big.bin"]);
    let copied = target.resolve("big.bin").unwrap();
    assert_eq!(target.read(&copied).unwrap(), data);
    assert!(!entry.exists());
}

#[tokio::test]
async fn broken_download_discards_the_partial_backup() {
    let cache_dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemoryBackend::new());
    let target = Arc::new(MemoryBackend::new());
    let file = source.add_file(&source.root(), "big.bin", vec![5u8; 200_000]);
    source.break_source_at(&file, 70_000);
    let options = ExecutionOptions {
        backup_threshold: 0,
        cache_dir: Some(cache_dir.path().to_path_buf()),
        ..ExecutionOptions::default()
    };

    let err = transfer(
        &source,
        &target,
        TransferMode::Copy,
        &[file.clone()],
        target.root(),
        options,
    )
    .await
    .unwrap_err();

    let TransferError::Aggregate(agg) = err else {
        panic!("expected aggregate error");
    };
    assert_eq!(agg.failures.len(), 1);
    assert!(matches!(agg.failures[0].error, TransferError::Io(_)));
    assert!(target.child_names(&target.root()).is_empty());
    let entry = BackupCache::new(cache_dir.path()).path_for(&source.cache_scope(), &file);
    assert!(!entry.exists());
}

#[tokio::test]
async fn cancelled_transfer_reports_cancellation() {
    let source = Arc::new(MemoryBackend::new());
    let target = Arc::new(MemoryBackend::new());
    let a = sample_tree(&source);
    let engine = TransferEngine::new(source.clone(), target.clone(), ExecutionOptions::default());
    let request = TransferRequest {
        mode: TransferMode::Copy,
        items: vec![source.item(&a).unwrap()],
        target_dir: target.root(),
        keep_existing: false,
    };
    let cancel = CancellationToken::new();
    let plan = Arc::new(engine.plan(&request, &cancel).await.unwrap());

    cancel.cancel();
    let err = engine.execute(&plan, &cancel).await.unwrap_err();

    assert!(err.is_cancelled());
    assert!(matches!(engine.status().await, TransferStatus::Failed(_)));
    assert!(target.child_names(&target.root()).is_empty());
}

#[tokio::test]
async fn progress_reaches_the_total() {
    let source = Arc::new(MemoryBackend::new());
    let target = Arc::new(MemoryBackend::new());
    let a = sample_tree(&source);
    let engine = TransferEngine::new(source.clone(), target.clone(), ExecutionOptions::default());
    let request = TransferRequest {
        mode: TransferMode::Copy,
        items: vec![source.item(&a).unwrap()],
        target_dir: target.root(),
        keep_existing: false,
    };

    let summary = engine.run(&request, &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.bytes, 5);
    assert_eq!(engine.progress().total_bytes(), 5);
    assert_eq!(engine.progress().bytes_done(), 5);
    assert!(matches!(engine.status().await, TransferStatus::Complete));
}
