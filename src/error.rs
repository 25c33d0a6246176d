//! Error types for the transfer engine.
//!
//! `TransferError` is `Clone` so one unit's outcome can be handed to every task
//! awaiting it. I/O errors are shared behind an `Arc` for the same reason.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::core::models::ItemId;

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum TransferError {
    /// Credentials were rejected. Recoverable by one revalidation and retry.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The destination already holds an entry with this name.
    #[error("an item named '{name}' already exists")]
    DuplicatedItem { name: String, is_directory: bool },

    #[error("operation canceled")]
    Cancelled,

    #[error("item not found: {0}")]
    NotFound(ItemId),

    #[error("{operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },

    #[error("i/o error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The source stream ended before the expected number of bytes arrived.
    #[error("stream ended early: {written} of {expected:?} bytes")]
    Incomplete { written: u64, expected: Option<u64> },

    /// The parent unit failed, so this one never ran.
    #[error("parent '{0}' failed")]
    DependencyFailed(String),

    #[error(transparent)]
    Aggregate(AggregateError),
}

impl TransferError {
    pub fn backend(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            message: message.into(),
        }
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        if crate::stream::is_cancellation(&err) {
            return Self::Cancelled;
        }
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::AccessDenied(err.to_string()),
            _ => Self::Io(Arc::new(err)),
        }
    }
}

/// One failed node inside an aggregate.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    pub label: String,
    pub item: ItemId,
    pub is_directory: bool,
    pub error: TransferError,
}

/// Failures collected after every independent unit of a transfer finished.
#[derive(Debug, Clone)]
pub struct AggregateError {
    pub failures: Vec<NodeFailure>,
    pub succeeded: usize,
}

/// Which kind of entries clashed when every failure is a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKind {
    File,
    Folder,
    Mixed,
}

/// User-facing classification of an aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureSummary {
    Duplicate(DuplicateKind),
    Generic { failed: usize, succeeded: usize },
}

impl AggregateError {
    pub fn classify(&self) -> FailureSummary {
        let all_duplicates = !self.failures.is_empty()
            && self
                .failures
                .iter()
                .all(|f| matches!(f.error, TransferError::DuplicatedItem { .. }));

        if !all_duplicates {
            return FailureSummary::Generic {
                failed: self.failures.len(),
                succeeded: self.succeeded,
            };
        }

        let folders = self.failures.iter().filter(|f| f.is_directory).count();
        let kind = if folders == 0 {
            DuplicateKind::File
        } else if folders == self.failures.len() {
            DuplicateKind::Folder
        } else {
            DuplicateKind::Mixed
        };
        FailureSummary::Duplicate(kind)
    }

    pub fn user_message(&self) -> String {
        match self.classify() {
            FailureSummary::Duplicate(DuplicateKind::File) => {
                "A file with the same name already exists at the destination".to_string()
            }
            FailureSummary::Duplicate(DuplicateKind::Folder) => {
                "A folder with the same name already exists at the destination".to_string()
            }
            FailureSummary::Duplicate(DuplicateKind::Mixed) => {
                "Files and folders with the same names already exist at the destination"
                    .to_string()
            }
            FailureSummary::Generic { failed, succeeded } if succeeded > 0 => format!(
                "{} of {} items could not be transferred",
                failed,
                failed + succeeded
            ),
            FailureSummary::Generic { failed, .. } => {
                format!("The transfer failed ({} item(s))", failed)
            }
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} item(s) failed, {} succeeded",
            self.failures.len(),
            self.succeeded
        )?;
        for failure in self.failures.iter().take(10) {
            write!(f, "\n  - {}: {}", failure.label, failure.error)?;
        }
        if self.failures.len() > 10 {
            write!(f, "\n  ... and {} more", self.failures.len() - 10)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
