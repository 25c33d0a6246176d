//! Entry point tying collision detection, planning and execution together.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::backend::StorageBackend;
use crate::core::collision::detect_collisions;
use crate::core::coordinator::{Coordinator, ExecutionOptions, TransferSummary};
use crate::core::models::{Item, ItemId, TransferMode};
use crate::core::plan::{Plan, PlanBuilder};
use crate::core::progress::ProgressTracker;
use crate::error::{Result, TransferError};

/// Status of a transfer as seen by a caller polling for progress.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferStatus {
    Ready,
    InProgress {
        total_bytes: u64,
        bytes_copied: u64,
        current_file: String,
        percentage: u8,
    },
    Complete,
    Failed(String),
}

/// A copy, move or download of selected items into one destination directory.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub mode: TransferMode,
    pub items: Vec<Item>,
    pub target_dir: ItemId,
    /// Merge into existing directories and leave equivalent files alone.
    pub keep_existing: bool,
}

pub struct TransferEngine {
    source: Arc<dyn StorageBackend>,
    target: Arc<dyn StorageBackend>,
    options: ExecutionOptions,
    progress: ProgressTracker,
    outcome: RwLock<Option<TransferStatus>>,
}

impl TransferEngine {
    pub fn new(
        source: Arc<dyn StorageBackend>,
        target: Arc<dyn StorageBackend>,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            source,
            target,
            options,
            progress: ProgressTracker::new(),
            outcome: RwLock::new(None),
        }
    }

    /// Report progress into an existing tracker instead of a private one.
    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub async fn status(&self) -> TransferStatus {
        if let Some(outcome) = self.outcome.read().await.clone() {
            return outcome;
        }
        self.progress.status().await
    }

    /// Selected items that match an entry already in `target_dir`.
    pub async fn find_collisions(&self, items: &[Item], target_dir: &ItemId) -> Result<Vec<Item>> {
        detect_collisions(self.target.as_ref(), items, target_dir).await
    }

    pub async fn plan(&self, request: &TransferRequest, cancel: &CancellationToken) -> Result<Plan> {
        PlanBuilder::new(
            self.source.as_ref(),
            self.target.as_ref(),
            request.mode,
            request.keep_existing,
        )
        .with_cancellation(cancel.clone())
        .build(&request.items, &request.target_dir)
        .await
    }

    pub async fn execute(
        &self,
        plan: &Arc<Plan>,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary> {
        *self.outcome.write().await = None;
        let coordinator = Coordinator::new(
            Arc::clone(&self.source),
            Arc::clone(&self.target),
            self.options.clone(),
            self.progress.clone(),
        );
        let result = coordinator.execute(plan, cancel).await;

        let status = match &result {
            Ok(_) => TransferStatus::Complete,
            Err(TransferError::Aggregate(agg)) => TransferStatus::Failed(agg.user_message()),
            Err(e) => TransferStatus::Failed(e.to_string()),
        };
        *self.outcome.write().await = Some(status);
        result
    }

    /// Plan and execute in one call.
    pub async fn run(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary> {
        let plan = Arc::new(self.plan(request, cancel).await?);
        self.execute(&plan, cancel).await
    }
}
