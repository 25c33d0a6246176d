//! Unit-of-work scheduler.
//!
//! Each enqueued unit runs on its own tokio task. A unit may depend on another
//! unit: it waits for that unit to finish before taking one of the
//! `parallelism` permits, so a waiting child never holds a permit its parent
//! needs. Every [`UnitHandle`] can be awaited any number of times and always
//! yields the single outcome of the unit.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, warn};
use uuid::Uuid;

use super::progress::{ProgressHandle, ProgressTracker};
use crate::error::TransferError;

pub type UnitOutcome = Result<(), TransferError>;

pub type UnitFuture = Pin<Box<dyn Future<Output = UnitOutcome> + Send>>;

pub type UnitAction = Box<dyn FnOnce(UnitContext) -> UnitFuture + Send>;

/// Box an async closure as a [`UnitAction`].
pub fn unit_action<F, Fut>(f: F) -> UnitAction
where
    F: FnOnce(UnitContext) -> Fut + Send + 'static,
    Fut: Future<Output = UnitOutcome> + Send + 'static,
{
    Box::new(move |ctx: UnitContext| -> UnitFuture { Box::pin(f(ctx)) })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    CreateDirectory,
    TransferFile,
    /// Delegated to the backend's native copy or move.
    Direct,
}

pub struct UnitSpec {
    pub kind: UnitKind,
    pub label: String,
    /// Weight in the aggregated progress, in bytes.
    pub size_hint: Option<u64>,
    pub depends_on: Option<UnitHandle>,
}

/// What a running action gets from the scheduler.
pub struct UnitContext {
    pub id: Uuid,
    pub cancel: CancellationToken,
    pub progress: ProgressHandle,
}

struct UnitShared {
    id: Uuid,
    kind: UnitKind,
    label: String,
    size_hint: Option<u64>,
    cancel: CancellationToken,
    outcome: watch::Sender<Option<UnitOutcome>>,
}

#[derive(Clone)]
pub struct UnitHandle {
    shared: Arc<UnitShared>,
}

impl UnitHandle {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn kind(&self) -> UnitKind {
        self.shared.kind
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn size_hint(&self) -> Option<u64> {
        self.shared.size_hint
    }

    /// Wait for the unit and return its outcome. Safe to call from many tasks.
    pub async fn run(&self) -> UnitOutcome {
        let mut rx = self.shared.outcome.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Err(TransferError::Cancelled)),
            Err(_) => Err(TransferError::Cancelled),
        }
    }

    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_completed(&self) -> bool {
        self.shared.outcome.borrow().is_some()
    }

    /// The outcome if the unit already finished.
    pub fn outcome(&self) -> Option<UnitOutcome> {
        (*self.shared.outcome.borrow()).clone()
    }

    fn complete(&self, outcome: UnitOutcome) {
        self.shared.outcome.send_replace(Some(outcome));
    }
}

#[derive(Clone)]
pub struct Scheduler {
    permits: Arc<Semaphore>,
    progress: ProgressTracker,
}

impl Scheduler {
    pub fn new(parallelism: usize, progress: ProgressTracker) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
            progress,
        }
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub async fn enqueue(
        &self,
        spec: UnitSpec,
        cancel: &CancellationToken,
        action: UnitAction,
    ) -> UnitHandle {
        let id = Uuid::now_v7();
        let token = cancel.child_token();
        let progress = self
            .progress
            .register(id, &spec.label, spec.size_hint.unwrap_or(0))
            .await;
        let (outcome, _) = watch::channel(None);

        let handle = UnitHandle {
            shared: Arc::new(UnitShared {
                id,
                kind: spec.kind,
                label: spec.label,
                size_hint: spec.size_hint,
                cancel: token.clone(),
                outcome,
            }),
        };

        let span = debug_span!("unit", id = %id, label = %handle.label());
        let task = handle.clone();
        let permits = Arc::clone(&self.permits);
        let tracker = self.progress.clone();
        let depends_on = spec.depends_on;

        tokio::spawn(
            async move {
                let ctx = UnitContext {
                    id,
                    cancel: token,
                    progress,
                };
                // The action runs on its own task so a panic still completes the unit.
                let worker =
                    tokio::spawn(execute(depends_on, permits, action, ctx).in_current_span());
                let outcome = match worker.await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => {
                        warn!("Unit panicked");
                        Err(TransferError::backend("unit", "panicked"))
                    }
                    Err(_) => Err(TransferError::Cancelled),
                };
                match &outcome {
                    Ok(()) => debug!("Unit finished"),
                    Err(e) => debug!(error = %e, "Unit failed"),
                }
                tracker.finish(id, outcome.is_ok()).await;
                task.complete(outcome);
            }
            .instrument(span),
        );

        handle
    }
}

async fn execute(
    depends_on: Option<UnitHandle>,
    permits: Arc<Semaphore>,
    action: UnitAction,
    ctx: UnitContext,
) -> UnitOutcome {
    if let Some(parent) = depends_on {
        if let Err(e) = parent.run().await {
            return Err(match e {
                TransferError::Cancelled => TransferError::Cancelled,
                _ => TransferError::DependencyFailed(parent.label().to_string()),
            });
        }
    }

    let _permit = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(TransferError::Cancelled),
        permit = permits.acquire_owned() => permit.map_err(|_| TransferError::Cancelled)?,
    };
    if ctx.cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }

    debug!("Unit started");
    action(ctx).await
}
