use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::backend::{ProgressSink, StorageBackend};
use crate::core::models::{DirectoryInfo, FileInfo, Item, ItemId};
use crate::error::{Result, TransferError};
use crate::stream::{BLOCK_SIZE, ByteStream, MemoryStream};

const ROOT: u64 = 0;

enum NodeKind {
    Directory,
    File {
        data: Arc<Vec<u8>>,
        content_type: Option<String>,
        modified: Option<DateTime<Utc>>,
        openable: bool,
    },
}

struct Node {
    name: String,
    parent: Option<u64>,
    kind: NodeKind,
}

struct Tree {
    next_id: u64,
    nodes: BTreeMap<u64, Node>,
}

impl Tree {
    fn insert(&mut self, parent: u64, name: &str, kind: NodeKind) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                name: name.to_string(),
                parent: Some(parent),
                kind,
            },
        );
        id
    }

    fn children(&self, dir: u64) -> impl Iterator<Item = (u64, &Node)> {
        self.nodes
            .iter()
            .filter(move |(_, n)| n.parent == Some(dir))
            .map(|(id, n)| (*id, n))
    }

    fn name_taken(&self, dir: u64, name: &str) -> bool {
        let name = name.to_lowercase();
        self.children(dir).any(|(_, n)| n.name.to_lowercase() == name)
    }

    fn directory(&self, id: u64) -> Result<&Node> {
        match self.nodes.get(&id) {
            Some(node) if matches!(node.kind, NodeKind::Directory) => Ok(node),
            _ => Err(TransferError::NotFound(ItemId::new(id.to_string()))),
        }
    }

    /// Whether `node` is `ancestor` or lies below it.
    fn is_within(&self, node: u64, ancestor: u64) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    fn ensure_free(&self, dir: u64, name: &str, is_directory: bool) -> Result<()> {
        if self.name_taken(dir, name) {
            return Err(TransferError::DuplicatedItem {
                name: name.to_string(),
                is_directory,
            });
        }
        Ok(())
    }

    fn copy_subtree(&mut self, source: u64, target_dir: u64, name: &str) -> u64 {
        let kind = match self.nodes.get(&source).map(|n| &n.kind) {
            Some(NodeKind::File {
                data,
                content_type,
                modified,
                openable,
            }) => NodeKind::File {
                data: Arc::clone(data),
                content_type: content_type.clone(),
                modified: *modified,
                openable: *openable,
            },
            _ => NodeKind::Directory,
        };
        let copy = self.insert(target_dir, name, kind);

        let children: Vec<(u64, String)> = self
            .children(source)
            .map(|(id, n)| (id, n.name.clone()))
            .collect();
        for (child, child_name) in children {
            self.copy_subtree(child, copy, &child_name);
        }
        copy
    }

    fn item(&self, id: u64) -> Option<Item> {
        let node = self.nodes.get(&id)?;
        let id = ItemId::new(id.to_string());
        Some(match &node.kind {
            NodeKind::Directory => Item::Directory(DirectoryInfo {
                id,
                name: node.name.clone(),
            }),
            NodeKind::File {
                data,
                content_type,
                modified,
                ..
            } => Item::File(FileInfo {
                id,
                name: node.name.clone(),
                size: data.len() as u64,
                content_type: content_type.clone(),
                modified: *modified,
            }),
        })
    }
}

fn parse(id: &ItemId) -> Result<u64> {
    id.as_str()
        .parse()
        .map_err(|_| TransferError::NotFound(id.clone()))
}

/// In-process storage backend.
///
/// Holds a directory tree in memory and exposes knobs to simulate provider
/// behaviour: native operations on or off, unopenable files, stale
/// credentials, failing writes, and downloads that break halfway.
pub struct MemoryBackend {
    instance: Uuid,
    tree: Mutex<Tree>,
    native_ops: AtomicBool,
    pending_denials: AtomicUsize,
    revalidations: AtomicUsize,
    source_reads: Arc<AtomicUsize>,
    failing_names: Mutex<HashSet<String>>,
    rejected_uploads: Mutex<HashSet<String>>,
    broken_sources: Mutex<HashMap<u64, u64>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT,
            Node {
                name: String::new(),
                parent: None,
                kind: NodeKind::Directory,
            },
        );
        Self {
            instance: Uuid::now_v7(),
            tree: Mutex::new(Tree {
                next_id: ROOT + 1,
                nodes,
            }),
            native_ops: AtomicBool::new(false),
            pending_denials: AtomicUsize::new(0),
            revalidations: AtomicUsize::new(0),
            source_reads: Arc::new(AtomicUsize::new(0)),
            failing_names: Mutex::new(HashSet::new()),
            rejected_uploads: Mutex::new(HashSet::new()),
            broken_sources: Mutex::new(HashMap::new()),
        }
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> ItemId {
        ItemId::new(ROOT.to_string())
    }

    /// Allow native copy and move between items of this instance.
    pub fn set_native_ops(&self, enabled: bool) {
        self.native_ops.store(enabled, Ordering::SeqCst);
    }

    pub fn add_dir(&self, parent: &ItemId, name: &str) -> ItemId {
        let parent = parse(parent).unwrap_or(ROOT);
        let id = self.tree().insert(parent, name, NodeKind::Directory);
        ItemId::new(id.to_string())
    }

    pub fn add_file(&self, parent: &ItemId, name: &str, data: impl Into<Vec<u8>>) -> ItemId {
        self.add_typed_file(parent, name, data, None)
    }

    pub fn add_typed_file(
        &self,
        parent: &ItemId,
        name: &str,
        data: impl Into<Vec<u8>>,
        content_type: Option<&str>,
    ) -> ItemId {
        let parent = parse(parent).unwrap_or(ROOT);
        let id = self.tree().insert(
            parent,
            name,
            NodeKind::File {
                data: Arc::new(data.into()),
                content_type: content_type.map(str::to_string),
                modified: Some(Utc::now()),
                openable: true,
            },
        );
        ItemId::new(id.to_string())
    }

    pub fn set_openable(&self, id: &ItemId, openable: bool) {
        let Ok(key) = parse(id) else { return };
        if let Some(Node {
            kind: NodeKind::File { openable: o, .. },
            ..
        }) = self.tree().nodes.get_mut(&key)
        {
            *o = openable;
        }
    }

    /// Reject the next `times` data operations with `AccessDenied`.
    pub fn deny_access(&self, times: usize) {
        self.pending_denials.store(times, Ordering::SeqCst);
    }

    /// Make every write or directory creation with this name fail.
    pub fn fail_on(&self, name: &str) {
        self.failing_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_lowercase());
    }

    /// Reject the next upload with this name after its whole stream was read.
    pub fn reject_upload(&self, name: &str) {
        self.rejected_uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_lowercase());
    }

    /// Streams opened for this file fail once `offset` bytes were read.
    pub fn break_source_at(&self, id: &ItemId, offset: u64) {
        let Ok(key) = parse(id) else { return };
        self.broken_sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, offset);
    }

    pub fn revalidations(&self) -> usize {
        self.revalidations.load(Ordering::SeqCst)
    }

    /// Number of `read` calls served by streams opened from this backend.
    pub fn source_reads(&self) -> usize {
        self.source_reads.load(Ordering::SeqCst)
    }

    pub fn item(&self, id: &ItemId) -> Option<Item> {
        self.tree().item(parse(id).ok()?)
    }

    /// Find an entry by a `/`-separated path below the root.
    pub fn resolve(&self, path: &str) -> Option<ItemId> {
        let tree = self.tree();
        let mut current = ROOT;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = tree
                .children(current)
                .find(|(_, n)| n.name == part)
                .map(|(id, _)| id)?;
        }
        Some(ItemId::new(current.to_string()))
    }

    pub fn read(&self, id: &ItemId) -> Option<Vec<u8>> {
        let key = parse(id).ok()?;
        match &self.tree().nodes.get(&key)?.kind {
            NodeKind::File { data, .. } => Some(data.as_ref().clone()),
            NodeKind::Directory => None,
        }
    }

    /// Sorted names of the entries directly inside `dir`.
    pub fn child_names(&self, dir: &ItemId) -> Vec<String> {
        let Ok(key) = parse(dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = self
            .tree()
            .children(key)
            .map(|(_, n)| n.name.clone())
            .collect();
        names.sort();
        names
    }

    fn check_access(&self) -> Result<()> {
        let denied = self
            .pending_denials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if denied {
            return Err(TransferError::AccessDenied("token expired".to_string()));
        }
        Ok(())
    }

    fn check_failing(&self, operation: &'static str, name: &str) -> Result<()> {
        let failing = self
            .failing_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&name.to_lowercase());
        if failing {
            return Err(TransferError::backend(operation, format!("rejected '{}'", name)));
        }
        Ok(())
    }

    fn file_info(&self, id: u64) -> Result<FileInfo> {
        match self.tree().item(id) {
            Some(Item::File(f)) => Ok(f),
            _ => Err(TransferError::NotFound(ItemId::new(id.to_string()))),
        }
    }

    fn directory_info(&self, id: u64) -> Result<DirectoryInfo> {
        match self.tree().item(id) {
            Some(Item::Directory(d)) => Ok(d),
            _ => Err(TransferError::NotFound(ItemId::new(id.to_string()))),
        }
    }

    fn native_allowed(&self, id: &ItemId, target_dir: &ItemId) -> bool {
        if !self.native_ops.load(Ordering::SeqCst) {
            return false;
        }
        let tree = self.tree();
        match (parse(id), parse(target_dir)) {
            (Ok(id), Ok(dir)) => tree.nodes.contains_key(&id) && tree.directory(dir).is_ok(),
            _ => false,
        }
    }

    fn relocate(
        &self,
        id: &ItemId,
        target_dir: &ItemId,
        name: &str,
        is_directory: bool,
    ) -> Result<u64> {
        let (key, dir) = (parse(id)?, parse(target_dir)?);
        let mut tree = self.tree();
        tree.directory(dir)?;
        if tree.is_within(dir, key) {
            return Err(TransferError::backend("move", "cannot move a directory into itself"));
        }
        tree.ensure_free(dir, name, is_directory)?;
        let node = tree
            .nodes
            .get_mut(&key)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;
        node.parent = Some(dir);
        node.name = name.to_string();
        Ok(key)
    }

    fn duplicate(
        &self,
        id: &ItemId,
        target_dir: &ItemId,
        name: &str,
        is_directory: bool,
    ) -> Result<u64> {
        let (key, dir) = (parse(id)?, parse(target_dir)?);
        let mut tree = self.tree();
        tree.directory(dir)?;
        if !tree.nodes.contains_key(&key) {
            return Err(TransferError::NotFound(id.clone()));
        }
        if tree.is_within(dir, key) {
            return Err(TransferError::backend("copy", "cannot copy a directory into itself"));
        }
        tree.ensure_free(dir, name, is_directory)?;
        Ok(tree.copy_subtree(key, dir, name))
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn instance_id(&self) -> Uuid {
        self.instance
    }

    async fn can_open_file(&self, id: &ItemId) -> Result<bool> {
        let key = parse(id)?;
        Ok(matches!(
            self.tree().nodes.get(&key),
            Some(Node {
                kind: NodeKind::File { openable: true, .. },
                ..
            })
        ))
    }

    async fn can_copy_file(&self, id: &ItemId, target_dir: &ItemId) -> Result<bool> {
        Ok(self.native_allowed(id, target_dir))
    }

    async fn can_move_file(&self, id: &ItemId, target_dir: &ItemId) -> Result<bool> {
        Ok(self.native_allowed(id, target_dir))
    }

    async fn can_copy_directory(&self, id: &ItemId, target_dir: &ItemId) -> Result<bool> {
        Ok(self.native_allowed(id, target_dir))
    }

    async fn can_move_directory(&self, id: &ItemId, target_dir: &ItemId) -> Result<bool> {
        Ok(self.native_allowed(id, target_dir))
    }

    async fn get_directories(&self, dir: &ItemId) -> Result<Vec<DirectoryInfo>> {
        let key = parse(dir)?;
        let tree = self.tree();
        tree.directory(key)?;
        Ok(tree
            .children(key)
            .filter_map(|(id, _)| match tree.item(id) {
                Some(Item::Directory(d)) => Some(d),
                _ => None,
            })
            .collect())
    }

    async fn get_files(&self, dir: &ItemId) -> Result<Vec<FileInfo>> {
        let key = parse(dir)?;
        let tree = self.tree();
        tree.directory(key)?;
        Ok(tree
            .children(key)
            .filter_map(|(id, _)| match tree.item(id) {
                Some(Item::File(f)) => Some(f),
                _ => None,
            })
            .collect())
    }

    async fn open_file(&self, id: &ItemId) -> Result<Box<dyn ByteStream>> {
        self.check_access()?;
        let key = parse(id)?;
        let data = match self.tree().nodes.get(&key).map(|n| &n.kind) {
            Some(NodeKind::File {
                data,
                openable: true,
                ..
            }) => Arc::clone(data),
            Some(NodeKind::File { .. }) => {
                return Err(TransferError::backend("open", format!("{} is not downloadable", id)));
            }
            _ => return Err(TransferError::NotFound(id.clone())),
        };
        let mut stream =
            MemoryStream::read_once(data).with_read_counter(Arc::clone(&self.source_reads));
        let broken_at = self
            .broken_sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .copied();
        if let Some(offset) = broken_at {
            stream = stream.failing_at(offset);
        }
        Ok(Box::new(stream))
    }

    async fn write_file(
        &self,
        target_dir: &ItemId,
        meta: &FileInfo,
        name: &str,
        stream: &mut dyn ByteStream,
        progress: &dyn ProgressSink,
    ) -> Result<FileInfo> {
        self.check_access()?;
        self.check_failing("write", name)?;
        let dir = parse(target_dir)?;
        {
            let tree = self.tree();
            tree.directory(dir)?;
            tree.ensure_free(dir, name, false)?;
        }

        let mut data = Vec::with_capacity(meta.size as usize);
        let mut buf = vec![0u8; BLOCK_SIZE];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            progress.report(data.len() as u64);
        }
        if data.len() as u64 != meta.size {
            return Err(TransferError::Incomplete {
                written: data.len() as u64,
                expected: Some(meta.size),
            });
        }
        let rejected = self
            .rejected_uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name.to_lowercase());
        if rejected {
            return Err(TransferError::backend("write", format!("upload of '{}' rejected", name)));
        }

        let id = {
            let mut tree = self.tree();
            tree.ensure_free(dir, name, false)?;
            tree.insert(
                dir,
                name,
                NodeKind::File {
                    data: Arc::new(data),
                    content_type: meta.content_type.clone(),
                    modified: meta.modified,
                    openable: true,
                },
            )
        };
        self.file_info(id)
    }

    async fn create_directory(&self, parent: &ItemId, name: &str) -> Result<DirectoryInfo> {
        self.check_access()?;
        self.check_failing("create directory", name)?;
        let dir = parse(parent)?;
        let id = {
            let mut tree = self.tree();
            tree.directory(dir)?;
            tree.ensure_free(dir, name, true)?;
            tree.insert(dir, name, NodeKind::Directory)
        };
        self.directory_info(id)
    }

    async fn copy_file(&self, id: &ItemId, target_dir: &ItemId, name: &str) -> Result<FileInfo> {
        self.check_access()?;
        let copy = self.duplicate(id, target_dir, name, false)?;
        self.file_info(copy)
    }

    async fn move_file(&self, id: &ItemId, target_dir: &ItemId, name: &str) -> Result<FileInfo> {
        self.check_access()?;
        let key = self.relocate(id, target_dir, name, false)?;
        self.file_info(key)
    }

    async fn copy_directory(
        &self,
        id: &ItemId,
        target_dir: &ItemId,
        name: &str,
    ) -> Result<DirectoryInfo> {
        self.check_access()?;
        let copy = self.duplicate(id, target_dir, name, true)?;
        self.directory_info(copy)
    }

    async fn move_directory(
        &self,
        id: &ItemId,
        target_dir: &ItemId,
        name: &str,
    ) -> Result<DirectoryInfo> {
        self.check_access()?;
        let key = self.relocate(id, target_dir, name, true)?;
        self.directory_info(key)
    }

    async fn delete_file(&self, id: &ItemId) -> Result<()> {
        self.check_access()?;
        let key = parse(id)?;
        match self.tree().nodes.remove(&key) {
            Some(_) => Ok(()),
            None => Err(TransferError::NotFound(id.clone())),
        }
    }

    async fn delete_directory(&self, id: &ItemId) -> Result<()> {
        self.check_access()?;
        let key = parse(id)?;
        let mut tree = self.tree();
        tree.directory(key)?;
        if tree.children(key).next().is_some() {
            return Err(TransferError::backend("delete directory", "directory is not empty"));
        }
        tree.nodes.remove(&key);
        Ok(())
    }

    async fn revalidate_access(&self) -> Result<()> {
        self.revalidations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::NoProgress;

    #[tokio::test]
    async fn listing_and_resolve() {
        let backend = MemoryBackend::new();
        let root = backend.root();
        let a = backend.add_dir(&root, "A");
        backend.add_file(&a, "x.txt", b"x".to_vec());

        assert!(backend.resolve("A/x.txt").is_some());
        assert_eq!(backend.get_directories(&root).await.unwrap().len(), 1);
        assert_eq!(backend.get_files(&a).await.unwrap()[0].name, "x.txt");
    }

    #[tokio::test]
    async fn write_refuses_existing_name() {
        let backend = MemoryBackend::new();
        let root = backend.root();
        let existing = backend.add_file(&root, "a.txt", b"old".to_vec());
        let meta = match backend.item(&existing) {
            Some(Item::File(f)) => f,
            _ => unreachable!(),
        };

        let mut stream = MemoryStream::new(b"new".to_vec());
        let err = backend
            .write_file(&root, &meta, "A.TXT", &mut stream, &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::DuplicatedItem { .. }));
        assert_eq!(backend.read(&existing).unwrap(), b"old");
    }

    #[tokio::test]
    async fn denial_is_consumed_once() {
        let backend = MemoryBackend::new();
        let root = backend.root();
        let id = backend.add_file(&root, "a.txt", b"a".to_vec());
        backend.deny_access(1);

        assert!(backend.open_file(&id).await.err().unwrap().is_access_denied());
        assert!(backend.open_file(&id).await.is_ok());
    }

    #[tokio::test]
    async fn native_copy_duplicates_subtree() {
        let backend = MemoryBackend::new();
        let root = backend.root();
        let a = backend.add_dir(&root, "A");
        backend.add_file(&a, "x.txt", b"x".to_vec());
        let dest = backend.add_dir(&root, "dest");

        backend.copy_directory(&a, &dest, "A").await.unwrap();
        let copied = backend.resolve("dest/A/x.txt").unwrap();
        assert_eq!(backend.read(&copied).unwrap(), b"x");
        assert!(backend.resolve("A/x.txt").is_some());
    }

    #[tokio::test]
    async fn native_ops_refuse_the_own_subtree() {
        let backend = MemoryBackend::new();
        let root = backend.root();
        let a = backend.add_dir(&root, "A");
        let b = backend.add_dir(&a, "B");
        backend.add_file(&b, "y.txt", b"y".to_vec());

        let err = backend.copy_directory(&a, &b, "A").await.unwrap_err();
        assert!(matches!(err, TransferError::Backend { operation: "copy", .. }));
        let err = backend.move_directory(&a, &b, "A").await.unwrap_err();
        assert!(matches!(err, TransferError::Backend { operation: "move", .. }));
        assert!(backend.copy_directory(&a, &a, "A").await.is_err());

        assert_eq!(backend.child_names(&b), vec!["y.txt"]);
        assert_eq!(backend.resolve("A/B"), Some(b));
    }
}
