//! Identity rules deciding when a destination entry is "the same" item.

use crate::core::backend::StorageBackend;
use crate::core::models::{DirectoryInfo, FileInfo, Item, ItemId};
use crate::error::Result;

fn fold(s: &str) -> String {
    s.to_lowercase()
}

/// Split a file name into stem and extension. Leading dots are part of the stem.
pub fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx + 1..]),
        _ => (name, ""),
    }
}

/// Lowercase, strip parameters, and fold common aliases.
pub fn normalize_mime(content_type: &str) -> String {
    let base = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match base.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        "application/x-pdf" => "application/pdf".to_string(),
        "text/x-markdown" => "text/markdown".to_string(),
        "application/x-zip-compressed" | "application/x-zip" => "application/zip".to_string(),
        "audio/mp3" | "audio/x-mp3" => "audio/mpeg".to_string(),
        _ => base,
    }
}

fn same_content_type(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => {
            let a = normalize_mime(a);
            !a.is_empty() && a == normalize_mime(b)
        }
        _ => false,
    }
}

pub fn same_directory(a: &DirectoryInfo, b: &DirectoryInfo) -> bool {
    fold(&a.name) == fold(&b.name)
}

pub fn same_file(a: &FileInfo, b: &FileInfo) -> bool {
    let (a_stem, a_ext) = split_name(&a.name);
    let (b_stem, b_ext) = split_name(&b.name);

    fold(a_stem) == fold(b_stem)
        && (fold(a_ext) == fold(b_ext)
            || same_content_type(a.content_type.as_deref(), b.content_type.as_deref()))
}

/// Source items that match an entry of an already-fetched destination listing.
pub fn find_collisions<'a>(
    items: &'a [Item],
    dest_files: &[FileInfo],
    dest_dirs: &[DirectoryInfo],
) -> Vec<&'a Item> {
    items
        .iter()
        .filter(|item| match item {
            Item::Directory(dir) => dest_dirs.iter().any(|d| same_directory(dir, d)),
            Item::File(file) => dest_files.iter().any(|f| same_file(file, f)),
        })
        .collect()
}

/// Fetch the destination listing once and report colliding source items.
pub async fn detect_collisions(
    target: &dyn StorageBackend,
    items: &[Item],
    target_dir: &ItemId,
) -> Result<Vec<Item>> {
    let (files, dirs) = tokio::try_join!(
        target.get_files(target_dir),
        target.get_directories(target_dir)
    )?;
    Ok(find_collisions(items, &files, &dirs)
        .into_iter()
        .cloned()
        .collect())
}
