//! Periodic flush of every processor.
//!
//! Work deferred while a repository was locked only drains when its
//! processor is flushed, so every processor gets its own ticker.

use super::stages::Pipeline;
use crate::process::Processor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct FlushTicker {
    processor: Arc<dyn Processor>,
    period: Duration,
}

impl FlushTicker {
    pub fn new(processor: Arc<dyn Processor>, period: Duration) -> Self {
        Self { processor, period }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tracing::debug!("Flushing {}", self.processor.name());
                    if let Err(e) = self.processor.flush().await {
                        tracing::error!("Failed to flush {}: {:#}", self.processor.name(), e);
                    }
                }
            }
        }

        tracing::debug!("Flush ticker for {} stopped", self.processor.name());
    }
}

/// Start one ticker per processor in `pipeline`.
pub fn spawn_flush_tickers(pipeline: &Pipeline, period: Duration, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
    pipeline
        .processors()
        .map(|processor| {
            let ticker = FlushTicker::new(Arc::clone(processor), period);
            tokio::spawn(ticker.run(shutdown.clone()))
        })
        .collect()
}
