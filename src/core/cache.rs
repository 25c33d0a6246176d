//! On-disk backup entries for large indirect transfers.
//!
//! Each entry holds the bytes read so far from one source file. An entry whose
//! length equals the source size is complete and can stand in for the source
//! when the same file is transferred again.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tracing::debug;

use crate::core::models::ItemId;
use crate::error::Result;
use crate::stream::FileStream;

#[derive(Debug, Clone)]
pub struct BackupCache {
    dir: PathBuf,
}

impl BackupCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Entry file name: BLAKE3 of the source's cache scope and item id.
    pub fn key(scope: &str, id: &ItemId) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(scope.as_bytes());
        hasher.update(&[0]);
        hasher.update(id.as_str().as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    pub fn path_for(&self, scope: &str, id: &ItemId) -> PathBuf {
        self.dir.join(Self::key(scope, id))
    }

    /// Open a complete entry for reading, if one exists.
    pub async fn open_complete(
        &self,
        scope: &str,
        id: &ItemId,
        expected: u64,
    ) -> Result<Option<FileStream>> {
        let path = self.path_for(scope, id);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() && meta.len() == expected => {
                debug!(path = %path.display(), "Reusing complete backup");
                Ok(Some(FileStream::open(&path).await?))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create an empty entry to tee a source into.
    pub async fn sink(&self, scope: &str, id: &ItemId) -> Result<File> {
        fs::create_dir_all(&self.dir).await?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path_for(scope, id))
            .await?;
        Ok(file)
    }

    pub async fn discard(&self, scope: &str, id: &ItemId) -> Result<()> {
        match fs::remove_file(self.path_for(scope, id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn keys_depend_on_scope_and_item() {
        let a = "local:/srv/a";
        let b = "local:/srv/b";
        let id = ItemId::from("42");
        assert_eq!(BackupCache::key(a, &id), BackupCache::key(a, &id));
        assert_ne!(BackupCache::key(a, &id), BackupCache::key(b, &id));
        assert_ne!(
            BackupCache::key(a, &id),
            BackupCache::key(a, &ItemId::from("43"))
        );
        assert_eq!(BackupCache::key(a, &id).len(), 64);
    }

    #[tokio::test]
    async fn only_complete_entries_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BackupCache::new(dir.path().join("cache"));
        let scope = "memory";
        let id = ItemId::from("7");

        assert!(cache.open_complete(scope, &id, 4).await.unwrap().is_none());

        let mut sink = cache.sink(scope, &id).await.unwrap();
        sink.write_all(b"abc").await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);

        assert!(cache.open_complete(scope, &id, 4).await.unwrap().is_none());
        assert!(cache.open_complete(scope, &id, 3).await.unwrap().is_some());

        cache.discard(scope, &id).await.unwrap();
        cache.discard(scope, &id).await.unwrap();
        assert!(!cache.path_for(scope, &id).exists());
    }
}
