//! Storage backend over a local directory.
//!
//! Item ids are `/`-separated paths relative to the root, with `/` naming the
//! root itself. Writes are staged in a hidden partial file next to the final
//! name and renamed into place only once every byte arrived.

use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::core::backend::{ProgressSink, StorageBackend};
use crate::core::models::{DirectoryInfo, FileInfo, Item, ItemId};
use crate::error::{Result, TransferError};
use crate::stream::{BLOCK_SIZE, ByteStream, FileStream, StreamCloner};

const PARTIAL_SUFFIX: &str = ".ferry-partial";

const BUFFER_SIZE: usize = 128 * 1024;

pub struct LocalBackend {
    root: PathBuf,
    instance: Uuid,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            instance: Uuid::now_v7(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn root_id() -> ItemId {
        ItemId::from("/")
    }

    /// Id for a path relative to the root, e.g. `photos/2024/a.jpg`.
    pub fn id_for(relative: &str) -> ItemId {
        let trimmed = relative.trim_matches('/');
        if trimmed.is_empty() {
            return Self::root_id();
        }
        ItemId::new(format!("/{trimmed}"))
    }

    fn child_id(dir: &ItemId, name: &str) -> ItemId {
        match dir.as_str() {
            "/" => ItemId::new(format!("/{name}")),
            parent => ItemId::new(format!("{parent}/{name}")),
        }
    }

    /// Resolve an id to a path, refusing anything that leaves the root.
    pub fn path_of(&self, id: &ItemId) -> Result<PathBuf> {
        let relative = Path::new(id.as_str().trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(TransferError::NotFound(id.clone()));
        }
        Ok(self.root.join(relative))
    }

    /// Metadata snapshot of one entry, for building a selection.
    pub async fn item(&self, id: &ItemId) -> Result<Item> {
        let path = self.path_of(id)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TransferError::NotFound(id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            return Ok(Item::Directory(DirectoryInfo {
                id: id.clone(),
                name: entry_name(&path),
            }));
        }
        Ok(Item::File(file_info_from(id.clone(), &path, &meta)))
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(TransferError::backend(
                "name",
                format!("'{}' is not a valid entry name", name),
            ));
        }
        Ok(())
    }

    async fn ensure_free(path: &Path, name: &str, is_directory: bool) -> Result<()> {
        if tokio::fs::symlink_metadata(path).await.is_ok() {
            return Err(TransferError::DuplicatedItem {
                name: name.to_string(),
                is_directory,
            });
        }
        Ok(())
    }

    async fn existing_dir(&self, id: &ItemId) -> Result<PathBuf> {
        let path = self.path_of(id)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(path),
            Ok(_) => Err(TransferError::NotFound(id.clone())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(TransferError::NotFound(id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn file_info(&self, id: ItemId, path: &Path) -> Result<FileInfo> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(file_info_from(id, path, &meta))
    }

    fn native_allowed(&self, id: &ItemId, target_dir: &ItemId) -> bool {
        let (Ok(source), Ok(target)) = (self.path_of(id), self.path_of(target_dir)) else {
            return false;
        };
        source.exists() && target.is_dir() && !target.starts_with(&source)
    }

    async fn list(&self, dir: &ItemId) -> Result<Vec<(ItemId, PathBuf, fs::Metadata)>> {
        let path = self.existing_dir(dir).await?;
        let mut reader = tokio::fs::read_dir(&path).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let meta = entry.metadata().await?;
            entries.push((Self::child_id(dir, &name), entry.path(), meta));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_info_from(id: ItemId, path: &Path, meta: &fs::Metadata) -> FileInfo {
    FileInfo {
        id,
        name: entry_name(path),
        size: meta.len(),
        content_type: None,
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
    }
}

fn staging_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!(".{name}{PARTIAL_SUFFIX}"))
}

/// Copy one file with buffered I/O and keep its timestamps.
fn copy_file_blocking(source: &Path, dest: &Path) -> io::Result<u64> {
    let meta = fs::metadata(source)?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, fs::File::open(source)?);
    let dest_file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
        written += n as u64;
    }
    writer.flush()?;

    let atime = FileTime::from_last_access_time(&meta);
    let mtime = FileTime::from_last_modification_time(&meta);
    if let Err(e) = filetime::set_file_times(dest, atime, mtime) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve file timestamps");
    }
    Ok(written)
}

fn copy_tree_blocking(source: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree_blocking(&entry.path(), &target)?;
        } else {
            copy_file_blocking(&entry.path(), &target)?;
        }
    }
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransferError::backend("blocking task", e.to_string()))?
        .map_err(TransferError::from)
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn instance_id(&self) -> Uuid {
        self.instance
    }

    /// The canonical root, so every backend over the same directory shares
    /// backup entries.
    fn cache_scope(&self) -> String {
        let root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        format!("local:{}", root.display())
    }

    async fn can_open_file(&self, id: &ItemId) -> Result<bool> {
        let path = self.path_of(id)?;
        Ok(tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
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
        Ok(self
            .list(dir)
            .await?
            .into_iter()
            .filter(|(_, _, meta)| meta.is_dir())
            .map(|(id, path, _)| DirectoryInfo {
                id,
                name: entry_name(&path),
            })
            .collect())
    }

    async fn get_files(&self, dir: &ItemId) -> Result<Vec<FileInfo>> {
        Ok(self
            .list(dir)
            .await?
            .into_iter()
            .filter(|(_, _, meta)| meta.is_file())
            .map(|(id, path, meta)| file_info_from(id, &path, &meta))
            .collect())
    }

    async fn open_file(&self, id: &ItemId) -> Result<Box<dyn ByteStream>> {
        let path = self.path_of(id)?;
        match FileStream::open(&path).await {
            Ok(stream) => Ok(Box::new(stream)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(TransferError::NotFound(id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(
        &self,
        target_dir: &ItemId,
        meta: &FileInfo,
        name: &str,
        stream: &mut dyn ByteStream,
        progress: &dyn ProgressSink,
    ) -> Result<FileInfo> {
        Self::check_name(name)?;
        let dir = self.existing_dir(target_dir).await?;
        let dest = dir.join(name);
        Self::ensure_free(&dest, name, false).await?;

        let staging = staging_path(&dir, name);
        let sink = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging)
            .await?;

        let staged = stage(stream, sink, meta.size, progress).await;
        let committed = match staged {
            Ok(()) => commit(&staging, &dest, name, meta).await,
            Err(e) => Err(e),
        };
        if let Err(e) = committed {
            if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
                debug!(path = %staging.display(), error = %cleanup, "Failed to remove partial file");
            }
            return Err(e);
        }

        self.file_info(Self::child_id(target_dir, name), &dest).await
    }

    async fn create_directory(&self, parent: &ItemId, name: &str) -> Result<DirectoryInfo> {
        Self::check_name(name)?;
        let dir = self.existing_dir(parent).await?;
        let path = dir.join(name);
        Self::ensure_free(&path, name, true).await?;
        tokio::fs::create_dir(&path).await?;
        Ok(DirectoryInfo {
            id: Self::child_id(parent, name),
            name: name.to_string(),
        })
    }

    async fn copy_file(&self, id: &ItemId, target_dir: &ItemId, name: &str) -> Result<FileInfo> {
        Self::check_name(name)?;
        let source = self.path_of(id)?;
        let dest = self.existing_dir(target_dir).await?.join(name);
        Self::ensure_free(&dest, name, false).await?;

        let to = dest.clone();
        blocking(move || copy_file_blocking(&source, &to)).await?;
        self.file_info(Self::child_id(target_dir, name), &dest).await
    }

    async fn move_file(&self, id: &ItemId, target_dir: &ItemId, name: &str) -> Result<FileInfo> {
        Self::check_name(name)?;
        let source = self.path_of(id)?;
        let dest = self.existing_dir(target_dir).await?.join(name);
        Self::ensure_free(&dest, name, false).await?;

        tokio::fs::rename(&source, &dest).await?;
        self.file_info(Self::child_id(target_dir, name), &dest).await
    }

    async fn copy_directory(
        &self,
        id: &ItemId,
        target_dir: &ItemId,
        name: &str,
    ) -> Result<DirectoryInfo> {
        Self::check_name(name)?;
        let source = self.existing_dir(id).await?;
        let dest = self.existing_dir(target_dir).await?.join(name);
        if dest.starts_with(&source) {
            return Err(TransferError::backend(
                "copy directory",
                "cannot copy a directory into itself",
            ));
        }
        Self::ensure_free(&dest, name, true).await?;

        blocking(move || copy_tree_blocking(&source, &dest)).await?;
        Ok(DirectoryInfo {
            id: Self::child_id(target_dir, name),
            name: name.to_string(),
        })
    }

    async fn move_directory(
        &self,
        id: &ItemId,
        target_dir: &ItemId,
        name: &str,
    ) -> Result<DirectoryInfo> {
        Self::check_name(name)?;
        let source = self.existing_dir(id).await?;
        let dest = self.existing_dir(target_dir).await?.join(name);
        if dest.starts_with(&source) {
            return Err(TransferError::backend(
                "move directory",
                "cannot move a directory into itself",
            ));
        }
        Self::ensure_free(&dest, name, true).await?;

        tokio::fs::rename(&source, &dest).await?;
        Ok(DirectoryInfo {
            id: Self::child_id(target_dir, name),
            name: name.to_string(),
        })
    }

    async fn delete_file(&self, id: &ItemId) -> Result<()> {
        tokio::fs::remove_file(self.path_of(id)?).await?;
        Ok(())
    }

    async fn delete_directory(&self, id: &ItemId) -> Result<()> {
        tokio::fs::remove_dir(self.path_of(id)?).await?;
        Ok(())
    }
}

/// Drain `stream` into the staging file through a [`StreamCloner`].
async fn stage(
    stream: &mut dyn ByteStream,
    sink: tokio::fs::File,
    expected: u64,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let mut cloner = StreamCloner::new(stream, sink, CancellationToken::new());
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let n = cloner.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        progress.report(cloner.mirrored());
    }

    let written = cloner.mirrored();
    let (_, mut sink) = cloner.into_parts();
    sink.flush().await?;
    sink.sync_all().await?;
    if written != expected {
        return Err(TransferError::Incomplete {
            written,
            expected: Some(expected),
        });
    }
    Ok(())
}

async fn commit(staging: &Path, dest: &Path, name: &str, meta: &FileInfo) -> Result<()> {
    LocalBackend::ensure_free(dest, name, false).await?;
    tokio::fs::rename(staging, dest).await?;

    if let Some(modified) = meta.modified {
        let mtime = FileTime::from_unix_time(modified.timestamp(), modified.timestamp_subsec_nanos());
        let path = dest.to_path_buf();
        if let Err(e) = blocking(move || filetime::set_file_mtime(&path, mtime)).await {
            debug!(dest = %dest.display(), error = %e, "Failed to preserve modification time");
        }
    }
    Ok(())
}
