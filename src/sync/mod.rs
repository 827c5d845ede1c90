//! Bounded-concurrency replication of local files to object storage.

mod engine;
mod metrics;
mod retry;

pub use engine::{SyncConfig, SyncEngine, SyncError, SyncOutcome};
pub use metrics::{SyncMetrics, SyncReporter, SyncSnapshot};
pub use retry::RetryStack;
