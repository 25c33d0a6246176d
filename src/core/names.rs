//! Destination name allocation.
//!
//! Several units may create entries in the same destination directory at once.
//! The registry loads each directory's listing once and hands out names that
//! clash neither with what was there nor with what this transfer already
//! reserved. Names are compared case-insensitively.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;
use tracing::debug;

use crate::core::backend::StorageBackend;
use crate::core::collision::split_name;
use crate::core::models::ItemId;
use crate::error::Result;

#[derive(Default)]
pub struct NameRegistry {
    used: Mutex<HashMap<ItemId, HashSet<String>>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a free name for a new entry in `dir`.
    ///
    /// Returns `name` itself when it is free, otherwise `stem (n).ext` for files
    /// and `name (n)` for directories with the smallest free `n`.
    pub async fn reserve(
        &self,
        backend: &dyn StorageBackend,
        dir: &ItemId,
        name: &str,
        is_directory: bool,
    ) -> Result<String> {
        let mut used = self.used.lock().await;
        let taken = match used.entry(dir.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let (files, dirs) =
                    tokio::try_join!(backend.get_files(dir), backend.get_directories(dir))?;
                let names = files
                    .iter()
                    .map(|f| f.name.to_lowercase())
                    .chain(dirs.iter().map(|d| d.name.to_lowercase()))
                    .collect();
                entry.insert(names)
            }
        };

        let mut candidate = name.to_string();
        let mut n = 1;
        while taken.contains(&candidate.to_lowercase()) {
            candidate = numbered(name, n, is_directory);
            n += 1;
        }
        if candidate != name {
            debug!(original = %name, renamed = %candidate, %dir, "Name taken, using a numbered name");
        }
        taken.insert(candidate.to_lowercase());
        Ok(candidate)
    }

    /// Forget a reservation whose entry was never created.
    pub async fn release(&self, dir: &ItemId, name: &str) {
        if let Some(taken) = self.used.lock().await.get_mut(dir) {
            taken.remove(&name.to_lowercase());
        }
    }
}

fn numbered(name: &str, n: usize, is_directory: bool) -> String {
    if is_directory {
        return format!("{name} ({n})");
    }
    match split_name(name) {
        (stem, "") => format!("{stem} ({n})"),
        (stem, ext) => format!("{stem} ({n}).{ext}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;

    #[test]
    fn numbered_keeps_extension() {
        assert_eq!(numbered("report.pdf", 1, false), "report (1).pdf");
        assert_eq!(numbered("archive.tar.gz", 2, false), "archive.tar (2).gz");
        assert_eq!(numbered("README", 3, false), "README (3)");
        assert_eq!(numbered("photos.2024", 1, true), "photos.2024 (1)");
    }

    #[tokio::test]
    async fn free_names_are_returned_unchanged() {
        let backend = MemoryBackend::new();
        let registry = NameRegistry::new();
        let name = registry
            .reserve(&backend, &backend.root(), "a.txt", false)
            .await
            .unwrap();
        assert_eq!(name, "a.txt");
    }

    #[tokio::test]
    async fn existing_and_reserved_names_are_avoided() {
        let backend = MemoryBackend::new();
        let root = backend.root();
        backend.add_file(&root, "Report.PDF", b"x".to_vec());
        let registry = NameRegistry::new();

        let first = registry.reserve(&backend, &root, "report.pdf", false).await.unwrap();
        let second = registry.reserve(&backend, &root, "report.pdf", false).await.unwrap();
        assert_eq!(first, "report (1).pdf");
        assert_eq!(second, "report (2).pdf");

        registry.release(&root, &first).await;
        let third = registry.reserve(&backend, &root, "report.pdf", false).await.unwrap();
        assert_eq!(third, "report (1).pdf");
    }

    #[tokio::test]
    async fn concurrent_reservations_never_collide() {
        let backend = MemoryBackend::new();
        let root = backend.root();
        let registry = NameRegistry::new();

        let (a, b, c) = tokio::join!(
            registry.reserve(&backend, &root, "docs", true),
            registry.reserve(&backend, &root, "docs", true),
            registry.reserve(&backend, &root, "DOCS", true),
        );
        let mut names = vec![a.unwrap(), b.unwrap(), c.unwrap().to_lowercase()];
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3);
    }
}
