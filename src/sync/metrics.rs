//! Transfer counters and periodic status reporting for the sync engine.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters for one sync engine.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    /// Transfers handed to the worker pool (retries included)
    pub scheduled: AtomicU64,

    /// Transfers that finished, whatever the outcome
    pub completed: AtomicU64,

    /// Uploads that succeeded
    pub success: AtomicU64,

    /// Transfers that failed
    pub error: AtomicU64,

    /// Files whose remote copy was already current
    pub skipped: AtomicU64,

    /// Transfers re-run by the retry pass
    pub retried: AtomicU64,

    /// Workers currently inside a transfer
    pub active_workers: AtomicU64,

    start_time: Option<Instant>,
}

impl SyncMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a worker busy until the returned guard drops.
    pub fn worker_active(self: &Arc<Self>) -> ActiveWorker {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
        ActiveWorker {
            metrics: Arc::clone(self),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
        }
    }
}

/// Decrements the active worker gauge on drop.
pub struct ActiveWorker {
    metrics: Arc<SyncMetrics>,
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.metrics.active_workers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Counters at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSnapshot {
    pub scheduled: u64,
    pub completed: u64,
    pub success: u64,
    pub error: u64,
    pub skipped: u64,
    pub retried: u64,
    pub active_workers: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
}

impl std::fmt::Display for SyncSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Scheduled: {} Completed: {} Success: {} Error: {} Skipped: {} Retried: {} \
             Workers: {} Time: {:.3}s",
            self.scheduled,
            self.completed,
            self.success,
            self.error,
            self.skipped,
            self.retried,
            self.active_workers,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Logs a status line on a fixed period until cancelled.
pub struct SyncReporter {
    metrics: Arc<SyncMetrics>,
    interval_secs: u64,
}

impl SyncReporter {
    pub fn new(metrics: Arc<SyncMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::info!("{}", self.metrics.snapshot());
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Final: {}", self.metrics.snapshot());
                    break;
                }
            }
        }
    }
}
