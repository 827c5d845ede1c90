//! Drives tasks from the coalescer through the pipeline.
//!
//! Each task runs in its own spawned task; a semaphore caps how many are in
//! flight so a burst of notifications cannot fan out without bound.

use super::stages::{Pipeline, TaskOutcome};
use crate::task::Task;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tasks allowed through the pipeline at once
    pub task_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { task_concurrency: 16 }
    }
}

pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, config: SchedulerConfig) -> Self {
        Self { pipeline, config }
    }

    /// Consume `tasks` until the channel closes or `shutdown` fires, then wait
    /// for tasks already running. Running tasks are never cancelled.
    pub async fn run(&self, mut tasks: mpsc::Receiver<Task>, shutdown: CancellationToken) -> SchedulerStats {
        let semaphore = Arc::new(Semaphore::new(self.config.task_concurrency.max(1)));
        let mut running = JoinSet::new();
        let mut stats = SchedulerStats::default();

        tracing::info!("Scheduling tasks ({} concurrent)", self.config.task_concurrency);

        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                task = tasks.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            stats.tasks_received += 1;

            let permit = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::warn!("Shutting down, dropping {}", task);
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let pipeline = Arc::clone(&self.pipeline);
            running.spawn(async move {
                let _permit = permit;
                pipeline.run_task(Arc::new(task)).await
            });

            while let Some(result) = running.try_join_next() {
                stats.record(result);
            }
        }

        if !running.is_empty() {
            tracing::info!("Waiting for {} running tasks", running.len());
        }
        while let Some(result) = running.join_next().await {
            stats.record(result);
        }

        tracing::info!("Scheduler stopped: {}", stats);
        stats
    }
}

/// Statistics from a scheduler run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks taken off the channel
    pub tasks_received: usize,

    /// Tasks that made it through every stage
    pub tasks_completed: usize,

    /// Tasks stopped by a pre-stage failure
    pub tasks_aborted: usize,

    /// Processor failures inside completed tasks
    pub processor_failures: usize,

    /// Pipeline runs that panicked
    pub tasks_panicked: usize,
}

impl SchedulerStats {
    fn record(&mut self, result: Result<TaskOutcome, JoinError>) {
        match result {
            Ok(TaskOutcome::Completed { failures }) => {
                self.tasks_completed += 1;
                self.processor_failures += failures;
            }
            Ok(TaskOutcome::Aborted { .. }) => self.tasks_aborted += 1,
            Err(e) => {
                tracing::error!("Pipeline run panicked: {}", e);
                self.tasks_panicked += 1;
            }
        }
    }
}

impl std::fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Received: {}, Completed: {}, Aborted: {}, Processor failures: {}, Panicked: {}",
            self.tasks_received,
            self.tasks_completed,
            self.tasks_aborted,
            self.processor_failures,
            self.tasks_panicked
        )
    }
}
