pub mod backend;
pub mod cache;
pub mod collision;
pub mod coordinator;
pub mod models;
pub mod names;
pub mod plan;
pub mod progress;
pub mod scheduler;
pub mod transfer_engine;

pub use backend::{NoProgress, ProgressSink, StorageBackend};
pub use collision::{detect_collisions, find_collisions};
pub use coordinator::{Coordinator, ExecutionOptions, TransferSummary};
pub use models::{DirectoryInfo, FileInfo, Item, ItemId, TransferMode};
pub use plan::{ExecItem, Plan, PlanBuilder};
pub use progress::ProgressTracker;
pub use scheduler::{Scheduler, UnitHandle};
pub use transfer_engine::{TransferEngine, TransferRequest, TransferStatus};
