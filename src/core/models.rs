use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque, backend-defined identifier of a file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryInfo {
    pub id: ItemId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: ItemId,
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub modified: Option<DateTime<Utc>>,
}

/// Metadata snapshot of a source entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Item {
    Directory(DirectoryInfo),
    File(FileInfo),
}

impl Item {
    pub fn id(&self) -> &ItemId {
        match self {
            Self::Directory(d) => &d.id,
            Self::File(f) => &f.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Directory(d) => &d.name,
            Self::File(f) => &f.name,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Self::Directory(_))
    }

    /// Size in bytes; directories report zero.
    pub fn size(&self) -> u64 {
        match self {
            Self::Directory(_) => 0,
            Self::File(f) => f.size,
        }
    }
}

impl From<DirectoryInfo> for Item {
    fn from(d: DirectoryInfo) -> Self {
        Self::Directory(d)
    }
}

impl From<FileInfo> for Item {
    fn from(f: FileInfo) -> Self {
        Self::File(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    Copy,
    Move,
    /// Copy that always streams through this process.
    Download,
}

impl TransferMode {
    pub fn is_move(&self) -> bool {
        matches!(self, Self::Move)
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Self::Copy => "Copying",
            Self::Move => "Moving",
            Self::Download => "Downloading",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_move_removes_sources() {
        assert!(TransferMode::Move.is_move());
        assert!(!TransferMode::Copy.is_move());
        assert!(!TransferMode::Download.is_move());
        assert_eq!(TransferMode::Download.verb(), "Downloading");
    }
}
