//! repo-updated
//!
//! Fans repository change notifications out to a pipeline of sinks: pull the
//! checkout, replicate changed records to object storage, index them, relay
//! the news to another channel.
//!
//! # Architecture
//!
//! The daemon consists of:
//!
//! - **Pub/sub**: Redis subscription feeding raw CSV payloads
//! - **Coalescer**: CSV rows grouped into per-repository [`Task`]s
//! - **Pipeline**: pre, async and post stages of [`process::Processor`]s,
//!   driven by a bounded scheduler and flushed on a timer
//! - **Queue**: per-repository locking so a sink never runs twice at once for one repo
//! - **Sync**: concurrent, hash-diffing replication to object storage with a retry budget
//!
//! # Usage
//!
//! ```no_run
//! use repo_updated::{run_daemon, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("config.yaml".as_ref())?;
//!     run_daemon(config).await?;
//!     Ok(())
//! }
//! ```

pub mod coalesce;
pub mod config;
pub mod io;
pub mod pipeline;
pub mod process;
pub mod pubsub;
pub mod queue;
pub mod replay;
pub mod sync;
pub mod task;

pub use config::Config;
pub use pipeline::{Pipeline, Scheduler, SchedulerConfig, SchedulerStats};
pub use queue::{QueueError, RepoQueue};
pub use sync::{SyncConfig, SyncEngine, SyncError};
pub use task::Task;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const PAYLOAD_BUFFER: usize = 256;
const TASK_BUFFER: usize = 1024;

/// Run the daemon until interrupted.
pub async fn run_daemon(config: Config) -> Result<SchedulerStats> {
    config.validate()?;

    tracing::info!("Starting repo-updated");
    tracing::info!("Data root: {}", config.data_root.display());

    let pipeline = Arc::new(Pipeline::from_config(&config)?);
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Interrupt received, shutting down"),
            Err(e) => tracing::error!("Failed to listen for interrupt: {}", e),
        }
        signal_token.cancel();
    });

    let (payload_tx, payload_rx) = mpsc::channel::<String>(PAYLOAD_BUFFER);
    let (task_tx, task_rx) = mpsc::channel::<Task>(TASK_BUFFER);

    let subscriber = tokio::spawn(pubsub::subscribe(config.redis.clone(), payload_tx, shutdown.clone()));
    let coalescer = tokio::spawn(coalesce::run_coalescer(payload_rx, task_tx));
    let tickers = pipeline::spawn_flush_tickers(
        &pipeline,
        Duration::from_secs(config.processing.flush_interval_secs),
        &shutdown,
    );

    let scheduler = Scheduler::new(
        Arc::clone(&pipeline),
        SchedulerConfig {
            task_concurrency: config.processing.task_concurrency,
        },
    );
    let stats = scheduler.run(task_rx, shutdown.clone()).await;

    // The scheduler also stops if the subscriber gave up
    shutdown.cancel();

    let subscribed = subscriber.await.context("Subscriber panicked")?;
    if let Err(e) = coalescer.await {
        tracing::error!("Coalescer panicked: {}", e);
    }
    for ticker in tickers {
        if let Err(e) = ticker.await {
            tracing::error!("Flush ticker panicked: {}", e);
        }
    }

    // Last chance for work deferred while a repo was busy
    for processor in pipeline.processors() {
        if let Err(e) = processor.flush().await {
            tracing::error!("Final flush of {} failed: {:#}", processor.name(), e);
        }
    }

    subscribed?;
    tracing::info!("repo-updated stopped: {}", stats);
    Ok(stats)
}

/// What a one-shot sync run should replicate.
#[derive(Debug, Clone)]
pub enum SyncSource {
    /// Newline-delimited file list
    FileList(PathBuf),
    /// Explicit paths, absolute or relative to the root
    Paths(Vec<String>),
    /// Every file under the root
    Directory,
}

/// Replicate files under `root` to the configured destination once.
pub async fn run_sync(config: &Config, root: &Path, source: SyncSource) -> Result<sync::SyncSnapshot> {
    config.validate_s3_destination()?;

    let root = std::path::absolute(root).with_context(|| format!("Invalid root {}", root.display()))?;
    if !root.is_dir() {
        anyhow::bail!("Root {} does not exist", root.display());
    }

    let store = io::create_sync_store(&config.s3)?;
    let engine = Arc::new(SyncEngine::new(store, io::sync_config(&config.s3)));

    tracing::info!("Syncing {} to {}", root.display(), config.s3.destination_display());

    let shutdown = CancellationToken::new();
    let reporter = tokio::spawn(
        sync::SyncReporter::new(Arc::clone(engine.metrics()), config.processing.status_interval_secs)
            .run(shutdown.clone()),
    );

    let result = match source {
        SyncSource::FileList(list) => engine.sync_file_list(&list, &root).await.map_err(anyhow::Error::from),
        SyncSource::Paths(paths) => engine.sync_files(&paths, &root).await.map_err(anyhow::Error::from),
        SyncSource::Directory => engine.sync_directory(&root).await,
    };

    shutdown.cancel();
    if let Err(e) = reporter.await {
        tracing::error!("Status reporter panicked: {}", e);
    }

    result?;
    Ok(engine.metrics().snapshot())
}

/// Publish `repo#path` entries on the inbound channel as one payload.
/// Returns the payload; with `dry_run` nothing is published.
pub async fn publish(config: &Config, change_id: &str, entries: &[String], dry_run: bool) -> Result<String> {
    if entries.is_empty() {
        anyhow::bail!("Nothing to publish");
    }

    let payload = coalesce::encode_payload(change_id, entries)?;
    send_payload(config, &payload, entries.len(), dry_run).await?;
    Ok(payload)
}

/// Publish the record changes of a commit range in `repo` as one payload.
/// Returns the payload; with `dry_run` nothing is published.
pub async fn replay(config: &Config, repo: &Path, range: &replay::CommitRange, dry_run: bool) -> Result<String> {
    let payload = replay::replay_payload(&config.pull.git_bin, repo, range).await?;
    if payload.is_empty() {
        anyhow::bail!("No record changes to replay in {}", repo.display());
    }

    send_payload(config, &payload, payload.lines().count(), dry_run).await?;
    Ok(payload)
}

async fn send_payload(config: &Config, payload: &str, rows: usize, dry_run: bool) -> Result<()> {
    if dry_run {
        tracing::info!("[dry run] would publish {} rows to {}", rows, config.redis.channel);
        return Ok(());
    }

    pubsub::Publisher::new(&config.redis.url())?
        .publish(&config.redis.channel, payload)
        .await?;
    tracing::info!("Published {} rows to {}", rows, config.redis.channel);

    Ok(())
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
