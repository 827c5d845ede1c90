//! Task orchestration: staged execution, scheduling and periodic flushing.

mod flush;
mod scheduler;
mod stages;

pub use flush::{spawn_flush_tickers, FlushTicker};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
pub use stages::{Pipeline, TaskOutcome};
