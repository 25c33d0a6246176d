use async_trait::async_trait;
use uuid::Uuid;

use crate::core::models::{DirectoryInfo, FileInfo, ItemId};
use crate::error::Result;
use crate::stream::ByteStream;

/// Receives write progress from a backend, as absolute bytes written.
pub trait ProgressSink: Send + Sync {
    fn report(&self, bytes_done: u64);
}

/// Discards progress.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _bytes_done: u64) {}
}

/// A storage provider the engine can read from and write to.
///
/// The `can_*` queries decide whether an item is transferred natively. They are
/// only asked when source and destination are the same backend instance.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Identity of this backend instance. Native operations require equal ids.
    fn instance_id(&self) -> Uuid;

    /// Stable name of the storage this backend reads, used to key backup
    /// entries across runs. Defaults to the instance id, which only matches
    /// within one process.
    fn cache_scope(&self) -> String {
        self.instance_id().to_string()
    }

    async fn can_open_file(&self, id: &ItemId) -> Result<bool>;

    async fn can_copy_file(&self, _id: &ItemId, _target_dir: &ItemId) -> Result<bool> {
        Ok(false)
    }

    async fn can_move_file(&self, _id: &ItemId, _target_dir: &ItemId) -> Result<bool> {
        Ok(false)
    }

    async fn can_copy_directory(&self, _id: &ItemId, _target_dir: &ItemId) -> Result<bool> {
        Ok(false)
    }

    async fn can_move_directory(&self, _id: &ItemId, _target_dir: &ItemId) -> Result<bool> {
        Ok(false)
    }

    async fn get_directories(&self, dir: &ItemId) -> Result<Vec<DirectoryInfo>>;

    async fn get_files(&self, dir: &ItemId) -> Result<Vec<FileInfo>>;

    async fn open_file(&self, id: &ItemId) -> Result<Box<dyn ByteStream>>;

    /// Store `stream` as a new file called `name` in `target_dir`.
    ///
    /// Must not replace an existing entry; a clash is `DuplicatedItem`.
    async fn write_file(
        &self,
        target_dir: &ItemId,
        meta: &FileInfo,
        name: &str,
        stream: &mut dyn ByteStream,
        progress: &dyn ProgressSink,
    ) -> Result<FileInfo>;

    async fn create_directory(&self, parent: &ItemId, name: &str) -> Result<DirectoryInfo>;

    async fn copy_file(&self, id: &ItemId, target_dir: &ItemId, name: &str) -> Result<FileInfo>;

    async fn move_file(&self, id: &ItemId, target_dir: &ItemId, name: &str) -> Result<FileInfo>;

    async fn copy_directory(
        &self,
        id: &ItemId,
        target_dir: &ItemId,
        name: &str,
    ) -> Result<DirectoryInfo>;

    async fn move_directory(
        &self,
        id: &ItemId,
        target_dir: &ItemId,
        name: &str,
    ) -> Result<DirectoryInfo>;

    async fn delete_file(&self, id: &ItemId) -> Result<()>;

    /// Remove a directory. Fails if it still has entries.
    async fn delete_directory(&self, id: &ItemId) -> Result<()>;

    /// Refresh credentials after an `AccessDenied`.
    async fn revalidate_access(&self) -> Result<()> {
        Ok(())
    }
}
