//! Transfer planning.
//!
//! A plan is a flat arena of [`ExecItem`]s. Parent links are indices into the
//! arena and only express ordering: a node runs after its parent's unit has
//! finished and resolves its destination directory from the parent's result.

use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::backend::StorageBackend;
use crate::core::collision::{same_directory, same_file};
use crate::core::models::{DirectoryInfo, FileInfo, Item, ItemId, TransferMode};
use crate::core::scheduler::UnitHandle;
use crate::error::{Result, TransferError};

/// One planned creation or transfer step.
pub struct ExecItem {
    /// Destination directory, `None` until the parent directory exists.
    pub target_dir_id: Option<ItemId>,
    pub item_id: ItemId,
    pub item: Item,
    /// Index of the parent node in the plan.
    pub parent: Option<usize>,
    pub direct: bool,
    /// Index into the caller's selection, set only on selected items.
    pub context_item: Option<usize>,
    /// The destination directory already existed; nothing gets created.
    pub already_created: bool,
    result: OnceLock<ItemId>,
    operation: OnceLock<UnitHandle>,
}

impl ExecItem {
    fn new(
        item: Item,
        target_dir_id: Option<ItemId>,
        parent: Option<usize>,
        direct: bool,
        context_item: Option<usize>,
        existing: Option<ItemId>,
    ) -> Self {
        let result = OnceLock::new();
        let already_created = existing.is_some();
        if let Some(id) = existing {
            let _ = result.set(id);
        }
        Self {
            target_dir_id,
            item_id: item.id().clone(),
            item,
            parent,
            direct,
            context_item,
            already_created,
            result,
            operation: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.item.name()
    }

    pub fn is_directory(&self) -> bool {
        self.item.is_directory()
    }

    /// True when executing this node creates a new destination directory.
    pub fn is_creation(&self) -> bool {
        self.is_directory() && !self.direct && !self.already_created
    }

    pub fn result(&self) -> Option<&ItemId> {
        self.result.get()
    }

    /// Record the destination id. Only the first call has an effect.
    pub fn set_result(&self, id: ItemId) -> bool {
        self.result.set(id).is_ok()
    }

    pub fn operation(&self) -> Option<&UnitHandle> {
        self.operation.get()
    }

    pub(crate) fn set_operation(&self, handle: UnitHandle) {
        let _ = self.operation.set(handle);
    }
}

/// Dependency-ordered list of transfer steps.
pub struct Plan {
    items: Vec<ExecItem>,
    skipped: Vec<ItemId>,
    mode: TransferMode,
    keep_existing: bool,
    target_dir: ItemId,
}

impl Plan {
    pub fn items(&self) -> &[ExecItem] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&ExecItem> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Files left out because the source cannot open them.
    pub fn skipped(&self) -> &[ItemId] {
        &self.skipped
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    /// Existing destination entries are kept and merged into.
    pub fn keep_existing(&self) -> bool {
        self.keep_existing
    }

    pub fn target_dir(&self) -> &ItemId {
        &self.target_dir
    }

    /// Bytes that will be copied, natively or through this process.
    pub fn total_bytes(&self) -> u64 {
        self.items.iter().map(|i| i.item.size()).sum()
    }

    /// Number of file nodes in the plan.
    pub fn file_count(&self) -> usize {
        self.items.iter().filter(|i| !i.is_directory()).count()
    }

    /// True if `ancestor` is on the parent chain of `index`.
    pub fn is_ancestor(&self, ancestor: usize, index: usize) -> bool {
        let mut current = self.items.get(index).and_then(|i| i.parent);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.items.get(p).and_then(|i| i.parent);
        }
        false
    }

    /// Await the parent's unit, failing if the parent failed.
    pub async fn wait_for_parent(&self, index: usize) -> Result<()> {
        let Some(parent) = self.items.get(index).and_then(|i| i.parent) else {
            return Ok(());
        };
        let parent = &self.items[parent];
        if let Some(op) = parent.operation() {
            op.run().await.map_err(|e| match e {
                TransferError::Cancelled => TransferError::Cancelled,
                _ => TransferError::DependencyFailed(parent.name().to_string()),
            })?;
        }
        Ok(())
    }

    /// Destination directory of a node: the parent's result, else its own target.
    pub fn target_dir_for(&self, index: usize) -> Result<ItemId> {
        let item = &self.items[index];
        let from_parent = item
            .parent
            .and_then(|p| self.items[p].result())
            .cloned();
        from_parent
            .or_else(|| item.target_dir_id.clone())
            .ok_or_else(|| {
                TransferError::backend(
                    "resolve target",
                    format!("no destination directory for '{}'", item.name()),
                )
            })
    }
}

#[derive(Default)]
struct PlanState {
    items: Vec<ExecItem>,
    skipped: Vec<ItemId>,
}

impl PlanState {
    fn push(&mut self, item: ExecItem) -> usize {
        self.items.push(item);
        self.items.len() - 1
    }
}

type Listing = (
    Vec<FileInfo>,
    Vec<DirectoryInfo>,
    Vec<FileInfo>,
    Vec<DirectoryInfo>,
);

/// Expands a selection into a [`Plan`].
pub struct PlanBuilder<'a> {
    source: &'a dyn StorageBackend,
    target: &'a dyn StorageBackend,
    mode: TransferMode,
    keep_existing: bool,
    cancel: CancellationToken,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(
        source: &'a dyn StorageBackend,
        target: &'a dyn StorageBackend,
        mode: TransferMode,
        keep_existing: bool,
    ) -> Self {
        Self {
            source,
            target,
            mode,
            keep_existing,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn build(&self, selection: &[Item], target_dir: &ItemId) -> Result<Plan> {
        info!(
            selected = selection.len(),
            mode = ?self.mode,
            keep_existing = self.keep_existing,
            "Building transfer plan"
        );
        let mut state = PlanState::default();

        let (dest_files, dest_dirs) = if self.keep_existing {
            tokio::try_join!(
                self.target.get_files(target_dir),
                self.target.get_directories(target_dir)
            )?
        } else {
            (Vec::new(), Vec::new())
        };

        for (index, selected) in selection.iter().enumerate() {
            self.check_cancel()?;
            match selected {
                Item::File(file) => {
                    if !self.source.can_open_file(&file.id).await? {
                        debug!(file = %file.name, "Source cannot open file, leaving it out");
                        state.skipped.push(file.id.clone());
                        continue;
                    }
                    if self.keep_existing && dest_files.iter().any(|d| same_file(file, d)) {
                        debug!(file = %file.name, "Keeping existing destination file");
                        continue;
                    }
                    let direct = self.can_direct_file(&file.id, target_dir).await?;
                    state.push(ExecItem::new(
                        selected.clone(),
                        Some(target_dir.clone()),
                        None,
                        direct,
                        Some(index),
                        None,
                    ));
                }
                Item::Directory(dir) => {
                    let existing = if self.keep_existing {
                        dest_dirs
                            .iter()
                            .find(|d| same_directory(dir, d))
                            .map(|d| d.id.clone())
                    } else {
                        None
                    };
                    // A native copy cannot merge into an existing directory.
                    let direct =
                        existing.is_none() && self.can_direct_directory(&dir.id, target_dir).await?;

                    let node = state.push(ExecItem::new(
                        selected.clone(),
                        Some(target_dir.clone()),
                        None,
                        direct,
                        Some(index),
                        existing.clone(),
                    ));
                    if !direct {
                        self.expand(&mut state, node, dir.id.clone(), existing).await?;
                    }
                }
            }
        }

        let plan = Plan {
            items: state.items,
            skipped: state.skipped,
            mode: self.mode,
            keep_existing: self.keep_existing,
            target_dir: target_dir.clone(),
        };
        info!(
            nodes = plan.len(),
            files = plan.file_count(),
            total_bytes = plan.total_bytes(),
            skipped = plan.skipped.len(),
            "Transfer plan ready"
        );
        Ok(plan)
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    fn same_backend(&self) -> bool {
        self.source.instance_id() == self.target.instance_id()
    }

    async fn can_direct_file(&self, id: &ItemId, target_dir: &ItemId) -> Result<bool> {
        if !self.same_backend() {
            return Ok(false);
        }
        match self.mode {
            TransferMode::Copy => self.source.can_copy_file(id, target_dir).await,
            TransferMode::Move => self.source.can_move_file(id, target_dir).await,
            TransferMode::Download => Ok(false),
        }
    }

    async fn can_direct_directory(&self, id: &ItemId, target_dir: &ItemId) -> Result<bool> {
        if !self.same_backend() {
            return Ok(false);
        }
        match self.mode {
            TransferMode::Copy => self.source.can_copy_directory(id, target_dir).await,
            TransferMode::Move => self.source.can_move_directory(id, target_dir).await,
            TransferMode::Download => Ok(false),
        }
    }

    async fn listing(&self, source_dir: &ItemId, existing: Option<&ItemId>) -> Result<Listing> {
        match existing {
            Some(dest) if self.keep_existing => {
                tokio::try_join!(
                    self.source.get_files(source_dir),
                    self.source.get_directories(source_dir),
                    self.target.get_files(dest),
                    self.target.get_directories(dest)
                )
            }
            _ => {
                let (files, dirs) = tokio::try_join!(
                    self.source.get_files(source_dir),
                    self.source.get_directories(source_dir)
                )?;
                Ok((files, dirs, Vec::new(), Vec::new()))
            }
        }
    }

    /// Emit the subtree of `source_dir` below the node at `parent`.
    ///
    /// Files come first, then each subdirectory followed by its own subtree.
    fn expand<'s>(
        &'s self,
        state: &'s mut PlanState,
        parent: usize,
        source_dir: ItemId,
        existing: Option<ItemId>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 's>> {
        Box::pin(async move {
            self.check_cancel()?;
            let (files, dirs, dest_files, dest_dirs) =
                self.listing(&source_dir, existing.as_ref()).await?;

            for file in files {
                if !self.source.can_open_file(&file.id).await? {
                    debug!(file = %file.name, "Source cannot open file, leaving it out");
                    state.skipped.push(file.id.clone());
                    continue;
                }
                if self.keep_existing && dest_files.iter().any(|d| same_file(&file, d)) {
                    debug!(file = %file.name, "Keeping existing destination file");
                    continue;
                }
                state.push(ExecItem::new(
                    Item::File(file),
                    existing.clone(),
                    Some(parent),
                    false,
                    None,
                    None,
                ));
            }

            for dir in dirs {
                let found = if self.keep_existing {
                    dest_dirs
                        .iter()
                        .find(|d| same_directory(&dir, d))
                        .map(|d| d.id.clone())
                } else {
                    None
                };
                let dir_id = dir.id.clone();
                let node = state.push(ExecItem::new(
                    Item::Directory(dir),
                    existing.clone(),
                    Some(parent),
                    false,
                    None,
                    found.clone(),
                ));
                self.expand(state, node, dir_id, found).await?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;

    fn selection(backend: &MemoryBackend, ids: &[&ItemId]) -> Vec<Item> {
        ids.iter().filter_map(|id| backend.item(id)).collect()
    }

    fn names(plan: &Plan) -> Vec<&str> {
        plan.items().iter().map(ExecItem::name).collect()
    }

    #[tokio::test]
    async fn parents_precede_descendants() {
        let source = MemoryBackend::new();
        let target = MemoryBackend::new();
        let root = source.root();
        let top = source.add_dir(&root, "top");
        for i in 0..3 {
            let mid = source.add_dir(&top, &format!("mid{i}"));
            source.add_file(&mid, "a.txt", b"a".to_vec());
            let leaf = source.add_dir(&mid, "leaf");
            source.add_file(&leaf, "b.txt", b"bb".to_vec());
        }

        let plan = PlanBuilder::new(&source, &target, TransferMode::Copy, false)
            .build(&selection(&source, &[&top]), &target.root())
            .await
            .unwrap();

        assert_eq!(plan.len(), 1 + 3 * 4);
        for (index, item) in plan.items().iter().enumerate() {
            if let Some(parent) = item.parent {
                assert!(parent < index, "parent of {} comes after it", item.name());
                assert!(plan.items()[parent].is_directory());
            }
        }
        assert!(plan.is_ancestor(0, plan.len() - 1));
        assert_eq!(plan.total_bytes(), 9);
    }

    #[tokio::test]
    async fn unopenable_files_are_skipped_silently() {
        let source = MemoryBackend::new();
        let target = MemoryBackend::new();
        let root = source.root();
        let locked = source.add_file(&root, "locked.bin", b"x".to_vec());
        let open = source.add_file(&root, "open.bin", b"y".to_vec());
        source.set_openable(&locked, false);

        let plan = PlanBuilder::new(&source, &target, TransferMode::Copy, false)
            .build(&selection(&source, &[&locked, &open]), &target.root())
            .await
            .unwrap();

        assert_eq!(names(&plan), vec!["open.bin"]);
        assert_eq!(plan.skipped(), &[locked]);
        assert_eq!(plan.items()[0].context_item, Some(1));
    }

    #[tokio::test]
    async fn same_backend_native_directory_is_not_expanded() {
        let backend = MemoryBackend::new();
        backend.set_native_ops(true);
        let root = backend.root();
        let a = backend.add_dir(&root, "A");
        backend.add_file(&a, "x.txt", b"x".to_vec());
        let dest = backend.add_dir(&root, "dest");

        let plan = PlanBuilder::new(&backend, &backend, TransferMode::Move, false)
            .build(&selection(&backend, &[&a]), &dest)
            .await
            .unwrap();

        assert_eq!(plan.len(), 1);
        assert!(plan.items()[0].direct);
        assert!(!plan.items()[0].is_creation());
    }

    #[tokio::test]
    async fn download_never_goes_direct() {
        let backend = MemoryBackend::new();
        backend.set_native_ops(true);
        let root = backend.root();
        let a = backend.add_dir(&root, "A");
        backend.add_file(&a, "x.txt", b"x".to_vec());
        let dest = backend.add_dir(&root, "dest");

        let plan = PlanBuilder::new(&backend, &backend, TransferMode::Download, false)
            .build(&selection(&backend, &[&a]), &dest)
            .await
            .unwrap();

        assert_eq!(names(&plan), vec!["A", "x.txt"]);
        assert!(plan.items().iter().all(|i| !i.direct));
    }

    #[tokio::test]
    async fn cross_backend_with_native_ops_still_streams() {
        let source = MemoryBackend::new();
        let target = MemoryBackend::new();
        source.set_native_ops(true);
        target.set_native_ops(true);
        let file = source.add_file(&source.root(), "x.txt", b"x".to_vec());

        let plan = PlanBuilder::new(&source, &target, TransferMode::Copy, false)
            .build(&selection(&source, &[&file]), &target.root())
            .await
            .unwrap();

        assert!(!plan.items()[0].direct);
    }

    #[tokio::test]
    async fn cancelled_build_fails_fast() {
        let source = MemoryBackend::new();
        let target = MemoryBackend::new();
        let a = source.add_dir(&source.root(), "A");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = PlanBuilder::new(&source, &target, TransferMode::Copy, false)
            .with_cancellation(cancel)
            .build(&selection(&source, &[&a]), &target.root())
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn listing_failure_aborts_the_plan() {
        let source = MemoryBackend::new();
        let target = MemoryBackend::new();
        let ghost = Item::Directory(DirectoryInfo {
            id: ItemId::from("999"),
            name: "ghost".to_string(),
        });

        let result = PlanBuilder::new(&source, &target, TransferMode::Copy, false)
            .build(&[ghost], &target.root())
            .await;
        assert!(matches!(result, Err(TransferError::NotFound(_))));
    }

    #[tokio::test]
    async fn target_resolution_follows_parent_result() {
        let source = MemoryBackend::new();
        let target = MemoryBackend::new();
        let a = source.add_dir(&source.root(), "A");
        source.add_file(&a, "x.txt", b"x".to_vec());

        let plan = PlanBuilder::new(&source, &target, TransferMode::Copy, false)
            .build(&selection(&source, &[&a]), &target.root())
            .await
            .unwrap();

        assert_eq!(plan.target_dir_for(0).unwrap(), target.root());
        assert!(plan.target_dir_for(1).is_err());

        plan.items()[0].set_result(ItemId::from("created"));
        assert_eq!(plan.target_dir_for(1).unwrap(), ItemId::from("created"));
        assert!(plan.wait_for_parent(1).await.is_ok());
    }
}
