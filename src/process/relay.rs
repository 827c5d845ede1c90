//! Re-publish changed paths on a second pub/sub channel.

use super::Processor;
use crate::pubsub::Publisher;
use crate::task::Task;
use anyhow::Result;
use async_trait::async_trait;

/// Publishes each path of a task as its own message. Nothing is buffered.
pub struct RelayProcessor {
    publisher: Publisher,
    channel: String,
}

impl RelayProcessor {
    pub fn new(publisher: Publisher, channel: impl Into<String>) -> Self {
        Self {
            publisher,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl Processor for RelayProcessor {
    fn name(&self) -> &str {
        "pubsub"
    }

    async fn process_task(&self, task: &Task) -> Result<()> {
        if task.is_empty() {
            return Ok(());
        }
        self.publisher.publish_all(&self.channel, task.paths()).await
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
