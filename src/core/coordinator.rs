//! Plan execution.
//!
//! Every plan node becomes one scheduler unit whose dependency is the parent's
//! unit. Directory nodes create (or reuse) the destination directory and publish
//! its id. File nodes either hand the work to the backend's native operation or
//! stream the bytes through this process. Failures are collected once every
//! unit has finished.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::core::backend::{ProgressSink, StorageBackend};
use crate::core::cache::BackupCache;
use crate::core::models::{DirectoryInfo, FileInfo, Item, ItemId};
use crate::core::names::NameRegistry;
use crate::core::plan::{ExecItem, Plan};
use crate::core::progress::ProgressTracker;
use crate::core::scheduler::{Scheduler, UnitContext, UnitKind, UnitOutcome, UnitSpec, unit_action};
use crate::error::{AggregateError, NodeFailure, Result, TransferError};
use crate::stream::{BackupStream, ByteStream, StreamObserver, StreamWatcher};

/// Files at least this large are teed into the backup cache.
pub const DEFAULT_BACKUP_THRESHOLD: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Units allowed to run at the same time.
    pub parallelism: usize,
    pub backup_threshold: u64,
    /// Backups are disabled without a cache directory.
    pub cache_dir: Option<PathBuf>,
    /// Keep backup entries after a successful write.
    pub keep_backups: bool,
    /// Pick `name (n)` for new entries whose name is taken. When off, the
    /// destination reports the clash as `DuplicatedItem`.
    pub rename_conflicts: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            parallelism: 4,
            backup_threshold: DEFAULT_BACKUP_THRESHOLD,
            cache_dir: None,
            keep_backups: false,
            rename_conflicts: true,
        }
    }
}

/// What a finished transfer did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferSummary {
    /// Files streamed through this process.
    pub files: usize,
    /// Directories created at the destination.
    pub directories: usize,
    /// Items handed to the backend's native copy or move.
    pub direct: usize,
    pub bytes: u64,
    /// Files left out because the source could not open them.
    pub skipped: usize,
    /// Source entries removed after a move.
    pub removed_sources: usize,
}

impl TransferSummary {
    fn record(&mut self, node: &ExecItem) {
        if node.direct {
            self.direct += 1;
            self.bytes += node.item.size();
        } else if node.is_directory() {
            if !node.already_created {
                self.directories += 1;
            }
        } else {
            self.files += 1;
            self.bytes += node.item.size();
        }
    }
}

/// Run `attempt`, and once more after revalidating if access was denied.
pub async fn with_access_retry<T, F, Fut>(
    backend: &dyn StorageBackend,
    operation: &'static str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match attempt().await {
        Err(e) if e.is_access_denied() => {
            warn!(operation, error = %e, "Access denied, revalidating and retrying once");
            backend.revalidate_access().await?;
            attempt().await
        }
        other => other,
    }
}

/// A source stream ready to be written, and where its bytes come from.
struct OpenedSource {
    stream: Box<dyn ByteStream>,
    /// Served from an existing backup entry.
    reused: bool,
    /// Teed into a new backup entry.
    backed_up: bool,
}

struct Shared {
    source: Arc<dyn StorageBackend>,
    target: Arc<dyn StorageBackend>,
    names: NameRegistry,
    cache: Option<BackupCache>,
    options: ExecutionOptions,
}

pub struct Coordinator {
    shared: Arc<Shared>,
    scheduler: Scheduler,
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn StorageBackend>,
        target: Arc<dyn StorageBackend>,
        options: ExecutionOptions,
        progress: ProgressTracker,
    ) -> Self {
        let scheduler = Scheduler::new(options.parallelism, progress);
        let cache = options.cache_dir.clone().map(BackupCache::new);
        Self {
            shared: Arc::new(Shared {
                source,
                target,
                names: NameRegistry::new(),
                cache,
                options,
            }),
            scheduler,
        }
    }

    /// Execute every node of `plan` and wait for all of them.
    ///
    /// Returns `Cancelled` if the token fired, an `Aggregate` error if any node
    /// failed, and the summary otherwise. Node results stay readable on the plan.
    pub async fn execute(
        &self,
        plan: &Arc<Plan>,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary> {
        let span = info_span!("transfer", mode = ?plan.mode(), nodes = plan.len());
        self.execute_inner(plan, cancel).instrument(span).await
    }

    async fn execute_inner(
        &self,
        plan: &Arc<Plan>,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary> {
        info!(
            files = plan.file_count(),
            total_bytes = plan.total_bytes(),
            "Starting transfer"
        );

        for (index, node) in plan.items().iter().enumerate() {
            let depends_on = node
                .parent
                .and_then(|p| plan.items()[p].operation().cloned());
            let spec = UnitSpec {
                kind: unit_kind(node),
                label: node.name().to_string(),
                size_hint: (!node.is_directory()).then(|| node.item.size()),
                depends_on,
            };
            let shared = Arc::clone(&self.shared);
            let task_plan = Arc::clone(plan);
            let handle = self
                .scheduler
                .enqueue(
                    spec,
                    cancel,
                    unit_action(move |unit| async move {
                        shared.run_node(&task_plan, index, unit).await
                    }),
                )
                .await;
            node.set_operation(handle);
        }

        let mut summary = TransferSummary {
            skipped: plan.skipped().len(),
            ..TransferSummary::default()
        };
        let mut succeeded = vec![false; plan.len()];
        let mut failures = Vec::new();
        let mut cancelled = false;

        for (index, node) in plan.items().iter().enumerate() {
            let Some(op) = node.operation() else {
                continue;
            };
            match op.run().await {
                Ok(()) => {
                    succeeded[index] = true;
                    summary.record(node);
                }
                Err(TransferError::Cancelled) => cancelled = true,
                Err(TransferError::DependencyFailed(parent)) => {
                    debug!(item = %node.name(), %parent, "Not attempted, parent failed");
                }
                Err(error) => {
                    warn!(item = %node.name(), error = %error, "Transfer of item failed");
                    failures.push(NodeFailure {
                        label: node.name().to_string(),
                        item: node.item_id.clone(),
                        is_directory: node.is_directory(),
                        error,
                    });
                }
            }
        }

        if cancelled || cancel.is_cancelled() {
            info!("Transfer cancelled");
            return Err(TransferError::Cancelled);
        }

        if plan.mode().is_move() {
            summary.removed_sources = succeeded
                .iter()
                .zip(plan.items())
                .filter(|(ok, node)| **ok && !node.direct && !node.is_directory())
                .count();
            summary.removed_sources += self.shared.remove_moved_directories(plan, &succeeded).await;
        }

        if !failures.is_empty() {
            let aggregate = AggregateError {
                failures,
                succeeded: succeeded.iter().filter(|ok| **ok).count(),
            };
            warn!(
                failed = aggregate.failures.len(),
                succeeded = aggregate.succeeded,
                "Transfer finished with failures"
            );
            return Err(TransferError::Aggregate(aggregate));
        }

        info!(
            files = summary.files,
            directories = summary.directories,
            direct = summary.direct,
            bytes = summary.bytes,
            "Transfer complete"
        );
        Ok(summary)
    }
}

fn unit_kind(node: &ExecItem) -> UnitKind {
    if node.direct {
        UnitKind::Direct
    } else if node.is_directory() {
        UnitKind::CreateDirectory
    } else {
        UnitKind::TransferFile
    }
}

impl Shared {
    async fn run_node(&self, plan: &Plan, index: usize, unit: UnitContext) -> UnitOutcome {
        plan.wait_for_parent(index).await?;
        let node = &plan.items()[index];
        if node.direct {
            return self.run_direct(plan, index).await;
        }
        match &node.item {
            Item::Directory(dir) => self.create_directory(plan, index, dir).await,
            Item::File(file) => self.transfer_file(plan, index, file, &unit).await,
        }
    }

    async fn allocate(
        &self,
        plan: &Plan,
        dir: &ItemId,
        name: &str,
        is_directory: bool,
    ) -> Result<String> {
        if plan.keep_existing() || !self.options.rename_conflicts {
            return Ok(name.to_string());
        }
        self.names
            .reserve(self.target.as_ref(), dir, name, is_directory)
            .await
    }

    async fn create_directory(&self, plan: &Plan, index: usize, dir: &DirectoryInfo) -> UnitOutcome {
        let node = &plan.items()[index];
        if node.already_created {
            debug!(directory = %dir.name, "Merging into existing directory");
            return Ok(());
        }
        let parent = plan.target_dir_for(index)?;
        let name = self.allocate(plan, &parent, &dir.name, true).await?;
        let target = self.target.as_ref();
        let created = with_access_retry(target, "create directory", || {
            target.create_directory(&parent, &name)
        })
        .await?;
        debug!(directory = %name, id = %created.id, "Created directory");
        node.set_result(created.id);
        Ok(())
    }

    async fn run_direct(&self, plan: &Plan, index: usize) -> UnitOutcome {
        let node = &plan.items()[index];
        let dir = plan.target_dir_for(index)?;
        let name = self
            .allocate(plan, &dir, node.name(), node.is_directory())
            .await?;
        let source = self.source.as_ref();
        let id = &node.item_id;

        let result = match (node.is_directory(), plan.mode().is_move()) {
            (false, false) => {
                with_access_retry(source, "copy file", || source.copy_file(id, &dir, &name))
                    .await?
                    .id
            }
            (false, true) => {
                with_access_retry(source, "move file", || source.move_file(id, &dir, &name))
                    .await?
                    .id
            }
            (true, false) => {
                with_access_retry(source, "copy directory", || {
                    source.copy_directory(id, &dir, &name)
                })
                .await?
                .id
            }
            (true, true) => {
                with_access_retry(source, "move directory", || {
                    source.move_directory(id, &dir, &name)
                })
                .await?
                .id
            }
        };
        debug!(item = %node.name(), result = %result, "Native operation finished");
        node.set_result(result);
        Ok(())
    }

    async fn transfer_file(
        &self,
        plan: &Plan,
        index: usize,
        file: &FileInfo,
        unit: &UnitContext,
    ) -> UnitOutcome {
        let node = &plan.items()[index];
        let dir = plan.target_dir_for(index)?;
        let name = self.allocate(plan, &dir, &file.name, false).await?;
        let scope = self.source.cache_scope();

        let opened = match self.open_source(&scope, file, unit).await {
            Ok(opened) => opened,
            Err(e) => {
                self.names.release(&dir, &name).await;
                return Err(e);
            }
        };
        let reused = opened.reused;
        let backup = self.cache.as_ref().filter(|_| opened.backed_up);
        let source_backend = self.source.as_ref();

        let observer: Arc<dyn StreamObserver> = Arc::new(unit.progress.clone());
        let mut watched = StreamWatcher::unsignalled(opened.stream, observer, unit.cancel.clone());
        let written = self
            .write_with_retry(&dir, file, &name, &mut watched, &unit.progress)
            .await;
        let completion = watched.close().await;

        let written = match written {
            Ok(written) => written,
            Err(e) => {
                if !matches!(e, TransferError::DuplicatedItem { .. }) {
                    self.names.release(&dir, &name).await;
                }
                if let Some(cache) = backup {
                    match completion {
                        Ok(c) if c.succeeded() => {
                            debug!(file = %file.name, "Keeping the complete backup for a retry");
                        }
                        _ => {
                            if let Err(discard) = cache.discard(&scope, &file.id).await {
                                warn!(
                                    file = %file.name,
                                    error = %discard,
                                    "Could not remove partial backup"
                                );
                            }
                        }
                    }
                }
                return Err(e);
            }
        };

        if let Err(e) = &completion {
            debug!(file = %file.name, error = %e, "Closing source stream failed");
        }
        if let Some(cache) = &self.cache {
            if (backup.is_some() || reused) && !self.options.keep_backups {
                if let Err(e) = cache.discard(&scope, &file.id).await {
                    warn!(file = %file.name, error = %e, "Could not remove backup");
                }
            }
        }
        if plan.mode().is_move() {
            with_access_retry(source_backend, "delete file", || {
                source_backend.delete_file(&file.id)
            })
            .await?;
        }

        debug!(
            file = %file.name,
            stored_as = %written.name,
            bytes = written.size,
            "File transferred"
        );
        node.set_result(written.id);
        Ok(())
    }

    /// Open the bytes of `file`, from a complete backup entry when one exists.
    /// Files at or above the backup threshold are teed into a new entry.
    async fn open_source(
        &self,
        scope: &str,
        file: &FileInfo,
        unit: &UnitContext,
    ) -> Result<OpenedSource> {
        let cached = match &self.cache {
            Some(cache) => cache.open_complete(scope, &file.id, file.size).await?,
            None => None,
        };
        if let Some(stream) = cached {
            return Ok(OpenedSource {
                stream: Box::new(stream),
                reused: true,
                backed_up: false,
            });
        }

        let source_backend = self.source.as_ref();
        let source = with_access_retry(source_backend, "open file", || {
            source_backend.open_file(&file.id)
        })
        .await?;

        let cache = match &self.cache {
            Some(cache) if file.size >= self.options.backup_threshold => cache,
            _ => {
                return Ok(OpenedSource {
                    stream: source,
                    reused: false,
                    backed_up: false,
                });
            }
        };
        let sink = cache.sink(scope, &file.id).await?;
        let tee = BackupStream::new(source, sink, unit.cancel.clone());
        let prefetch = tee.spawn_prefetch();
        let label = file.name.clone();
        tokio::spawn(
            async move {
                match prefetch.await {
                    Ok(Ok(buffered)) => debug!(file = %label, buffered, "Backup prefetch stopped"),
                    Ok(Err(e)) => warn!(file = %label, error = %e, "Backup prefetch failed"),
                    Err(e) => warn!(file = %label, error = %e, "Backup prefetch task died"),
                }
            }
            .in_current_span(),
        );
        Ok(OpenedSource {
            stream: Box::new(tee),
            reused: false,
            backed_up: true,
        })
    }

    /// Write once, and again after revalidating if access was denied.
    ///
    /// The retry needs the stream back at its start, so it only happens when
    /// nothing was read yet or the stream can rewind.
    async fn write_with_retry(
        &self,
        dir: &ItemId,
        file: &FileInfo,
        name: &str,
        stream: &mut dyn ByteStream,
        progress: &dyn ProgressSink,
    ) -> Result<FileInfo> {
        let target = self.target.as_ref();
        match target.write_file(dir, file, name, stream, progress).await {
            Err(e) if e.is_access_denied() && (stream.position() == 0 || stream.can_seek()) => {
                warn!(file = %name, error = %e, "Write rejected, revalidating and retrying once");
                target.revalidate_access().await?;
                if stream.position() != 0 {
                    stream.seek(0).await?;
                }
                target.write_file(dir, file, name, stream, progress).await
            }
            other => other,
        }
    }

    /// Delete source directories of a move whose whole subtree succeeded.
    ///
    /// Descendants follow their directory in the plan, so walking it backwards
    /// visits the deepest directories first.
    async fn remove_moved_directories(&self, plan: &Plan, succeeded: &[bool]) -> usize {
        let source = self.source.as_ref();
        let mut removed = 0;
        for index in (0..plan.len()).rev() {
            let node = &plan.items()[index];
            if !node.is_directory() || node.direct || !succeeded[index] {
                continue;
            }
            let subtree_ok = (index + 1..plan.len())
                .filter(|&j| plan.is_ancestor(index, j))
                .all(|j| succeeded[j]);
            if !subtree_ok {
                continue;
            }
            match with_access_retry(source, "delete directory", || {
                source.delete_directory(&node.item_id)
            })
            .await
            {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(directory = %node.name(), error = %e, "Source directory kept after move");
                }
            }
        }
        removed
    }
}
