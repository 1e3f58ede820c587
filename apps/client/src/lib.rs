//! Client runtime for vocabulary progress: local persistence, offline sync
//! and the review orchestration that ties them to the scheduler.

pub mod config;
pub mod db;
pub mod session;
pub mod store;
pub mod sync;
pub mod telemetry;

pub use config::{ClientConfig, ProgressConfig, StoreConfig, SyncQueueConfig};
pub use session::{ProgressService, ReviewError, ReviewOutcome, StreakPolicy};
pub use store::PersistentStore;
pub use sync::{DrainPolicy, OperationKind, QueueStatus, SyncPayload, SyncQueue};
