//! Redis pub/sub: the inbound notification feed and outbound publishing.

use crate::config::RedisConfig;
use anyhow::{Context, Result};
use futures::StreamExt;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Publishes messages on a redis server.
#[derive(Clone)]
pub struct Publisher {
    client: redis::Client,
}

impl Publisher {
    /// Create a publisher. No connection is made until something is published.
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).with_context(|| format!("Invalid redis URL {}", url))?;
        Ok(Self { client })
    }

    pub async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.publish_all(channel, &[message]).await
    }

    /// Publish each message in order over one connection.
    pub async fn publish_all<S: AsRef<str>>(&self, channel: &str, messages: &[S]) -> Result<()> {
        let mut con = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to redis")?;

        for message in messages {
            let _receivers: i64 = con
                .publish(channel, message.as_ref())
                .await
                .with_context(|| format!("Failed to publish to {}", channel))?;
        }

        Ok(())
    }
}

/// Forward every message on the configured channel to `payloads` until shutdown.
///
/// Lost connections are re-established after a short delay.
pub async fn subscribe(config: RedisConfig, payloads: mpsc::Sender<String>, shutdown: CancellationToken) -> Result<()> {
    let client = redis::Client::open(config.url())
        .with_context(|| format!("Invalid redis address {}:{}", config.host, config.port))?;

    loop {
        match listen(&client, &config.channel, &payloads, &shutdown).await {
            Ok(()) => return Ok(()),
            Err(e) => tracing::error!("Lost subscription to {}: {:#}", config.channel, e),
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
        tracing::info!("Reconnecting to {}:{}", config.host, config.port);
    }
}

/// Ok means shutdown was requested or the payload receiver went away.
async fn listen(
    client: &redis::Client,
    channel: &str,
    payloads: &mpsc::Sender<String>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("Failed to connect to redis")?;
    pubsub
        .subscribe(channel)
        .await
        .with_context(|| format!("Failed to subscribe to {}", channel))?;

    tracing::info!("Subscribed to {}", channel);

    let mut messages = pubsub.on_message();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            message = messages.next() => {
                let Some(message) = message else {
                    anyhow::bail!("subscription stream ended");
                };

                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Failed to decode message on {}: {}", channel, e);
                        continue;
                    }
                };

                if payloads.send(payload).await.is_err() {
                    tracing::debug!("Payload receiver dropped, unsubscribing");
                    return Ok(());
                }
            }
        }
    }
}
