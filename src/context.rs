use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::{ProgressTracker, StorageBackend, TransferEngine};

/// Shared state for one invocation of the binary.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub progress: ProgressTracker,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            progress: ProgressTracker::new(),
        }
    }

    /// An engine between two backends, reporting into this context's tracker.
    pub fn engine(
        &self,
        source: Arc<dyn StorageBackend>,
        target: Arc<dyn StorageBackend>,
    ) -> TransferEngine {
        TransferEngine::new(source, target, self.config.execution_options())
            .with_progress(self.progress.clone())
    }
}
