//! Pipeline sinks.
//!
//! Every sink implements [`Processor`]. Most are a [`RepoProcessor`] wrapped
//! around a [`RepoSink`], which supplies the per-repository serialization and
//! path buffering; the relay has nothing to buffer and implements the trait
//! directly.

mod buffered;
mod elasticsearch;
mod lfs;
mod pull;
pub mod record;
mod registry;
mod relay;
mod s3;
mod tile38;

pub use buffered::{NotStarted, RepoProcessor, RepoSink};
pub use elasticsearch::ElasticsearchSink;
pub use lfs::LfsSink;
pub use pull::PullSink;
pub use registry::{build_processor, check_data_root};
pub use relay::RelayProcessor;
pub use s3::S3Sink;
pub use tile38::Tile38Sink;

use crate::task::Task;
use anyhow::Result;
use async_trait::async_trait;

/// A pipeline sink.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Stable name used in logs and stage configuration.
    fn name(&self) -> &str;

    /// Take a task. Work that cannot run right now is deferred, not dropped.
    async fn process_task(&self, task: &Task) -> Result<()>;

    /// Re-attempt any deferred work. At most one sweep runs at a time.
    async fn flush(&self) -> Result<()>;
}
