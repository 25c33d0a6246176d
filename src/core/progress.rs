//! In-memory progress tracking for a running transfer.
//!
//! Every scheduled unit registers its size weight here. Streams report absolute
//! byte positions through a [`ProgressHandle`], and callers query the aggregate
//! as a [`TransferStatus`]. Nothing is persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use uuid::Uuid;

use super::backend::ProgressSink;
use super::transfer_engine::TransferStatus;
use crate::stream::StreamObserver;

struct UnitProgress {
    label: String,
    size: u64,
    done: AtomicU64,
}

#[derive(Default)]
struct Totals {
    total_bytes: AtomicU64,
    bytes_done: AtomicU64,
}

/// Thread-safe store for live transfer progress.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<HashMap<Uuid, Arc<UnitProgress>>>>,
    totals: Arc<Totals>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a unit. `size` is its weight in the aggregate.
    pub async fn register(&self, unit: Uuid, label: &str, size: u64) -> ProgressHandle {
        let progress = Arc::new(UnitProgress {
            label: label.to_string(),
            size,
            done: AtomicU64::new(0),
        });
        self.totals.total_bytes.fetch_add(size, Ordering::Relaxed);

        let mut map = self.inner.write().await;
        map.insert(unit, Arc::clone(&progress));

        ProgressHandle {
            unit: progress,
            totals: Arc::clone(&self.totals),
        }
    }

    /// Stop tracking a unit. A successful unit counts as fully done.
    pub async fn finish(&self, unit: Uuid, succeeded: bool) {
        let mut map = self.inner.write().await;
        if let Some(progress) = map.remove(&unit) {
            if succeeded {
                let done = progress.done.swap(progress.size, Ordering::Relaxed);
                if progress.size > done {
                    self.totals
                        .bytes_done
                        .fetch_add(progress.size - done, Ordering::Relaxed);
                }
            }
        }
    }

    /// Bytes done for a unit that is still tracked.
    pub async fn get(&self, unit: Uuid) -> Option<u64> {
        let map = self.inner.read().await;
        map.get(&unit).map(|p| p.done.load(Ordering::Relaxed))
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.totals.total_bytes.load(Ordering::Relaxed)
    }

    pub fn bytes_done(&self) -> u64 {
        self.totals.bytes_done.load(Ordering::Relaxed)
    }

    /// Aggregate status. `current_file` names the active unit furthest along.
    pub async fn status(&self) -> TransferStatus {
        let map = self.inner.read().await;
        let total_bytes = self.total_bytes();
        let bytes_copied = self.bytes_done().min(total_bytes);

        if map.is_empty() && total_bytes == 0 {
            return TransferStatus::Ready;
        }

        let current_file = map
            .values()
            .filter(|p| p.done.load(Ordering::Relaxed) > 0)
            .max_by_key(|p| p.done.load(Ordering::Relaxed))
            .or_else(|| map.values().next())
            .map(|p| p.label.clone())
            .unwrap_or_default();

        let percentage = if total_bytes > 0 {
            ((bytes_copied as f64 / total_bytes as f64) * 100.0) as u8
        } else if map.is_empty() {
            100
        } else {
            0
        };

        TransferStatus::InProgress {
            total_bytes,
            bytes_copied,
            current_file,
            percentage,
        }
    }
}

/// Per-unit progress reporter handed to streams and backends.
#[derive(Clone)]
pub struct ProgressHandle {
    unit: Arc<UnitProgress>,
    totals: Arc<Totals>,
}

impl ProgressHandle {
    /// A handle not attached to any tracker.
    pub fn detached() -> Self {
        Self {
            unit: Arc::new(UnitProgress {
                label: String::new(),
                size: 0,
                done: AtomicU64::new(0),
            }),
            totals: Arc::new(Totals::default()),
        }
    }

    pub fn bytes_done(&self) -> u64 {
        self.unit.done.load(Ordering::Relaxed)
    }
}

impl ProgressSink for ProgressHandle {
    /// Positions only move forward; a rewind for a retry is not double counted.
    fn report(&self, bytes_done: u64) {
        let previous = self.unit.done.fetch_max(bytes_done, Ordering::Relaxed);
        if bytes_done > previous {
            self.totals
                .bytes_done
                .fetch_add(bytes_done - previous, Ordering::Relaxed);
        }
    }
}

impl StreamObserver for ProgressHandle {
    fn on_read(&self, position: u64, _data: &[u8], _count: usize) {
        self.report(position);
    }
}
