//! Build processors from configuration by name.

use super::{ElasticsearchSink, LfsSink, Processor, PullSink, RelayProcessor, RepoProcessor, S3Sink, Tile38Sink};
use crate::config::Config;
use crate::io::{create_sync_store, sync_config};
use crate::pubsub::Publisher;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resolve the data root to an absolute directory that exists.
pub fn check_data_root(data_root: &Path) -> Result<PathBuf> {
    let root = std::path::absolute(data_root)
        .with_context(|| format!("Invalid data root {}", data_root.display()))?;
    if !root.is_dir() {
        anyhow::bail!("Data root {} does not exist", root.display());
    }
    Ok(root)
}

/// Build the processor called `name`, checking everything it needs up front.
pub fn build_processor(name: &str, config: &Config) -> Result<Arc<dyn Processor>> {
    let data_root = check_data_root(&config.data_root)?;

    let processor: Arc<dyn Processor> = match name {
        "pull" => Arc::new(RepoProcessor::new(PullSink::new(data_root, config.pull.clone()))),
        "lfs" => Arc::new(RepoProcessor::new(LfsSink::new(data_root, config.pull.git_bin.clone()))),
        "s3" => {
            config.validate_s3_destination()?;
            let store = create_sync_store(&config.s3)?;
            tracing::info!("Replicating to {}", config.s3.destination_display());
            Arc::new(RepoProcessor::new(S3Sink::new(data_root, store, sync_config(&config.s3))))
        }
        "elasticsearch" => {
            let sink = ElasticsearchSink::new(data_root, config.elasticsearch.clone());
            sink.check_index_tool()?;
            Arc::new(RepoProcessor::new(sink))
        }
        "tile38" => Arc::new(RepoProcessor::new(Tile38Sink::new(data_root, &config.tile38)?)),
        "pubsub" => {
            let publisher = Publisher::new(&config.redis.url())?;
            Arc::new(RelayProcessor::new(publisher, config.relay.channel.clone()))
        }
        other => anyhow::bail!("Unknown processor '{}'", other),
    };

    tracing::debug!("Built processor {}", processor.name());
    Ok(processor)
}
