//! Object store construction for the replication sink.
//!
//! S3 clients are tuned for many small objects written by a modest worker
//! pool; a local directory can stand in for the bucket when mirroring to disk.

use crate::config::S3Config;
use crate::sync::SyncConfig;
use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        // Whole request, retries included
        .with_timeout(Duration::from_secs(60))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(64)
}

/// Retry configuration for transient S3 failures (429 and 5xx).
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(60),
    }
}

/// Create an authenticated S3 client.
///
/// Credentials come from the environment (AWS_ACCESS_KEY_ID and friends),
/// the shared AWS config files, or the instance profile.
fn create_s3_store(bucket: &str, region: &str) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating S3 client for bucket {} ({})", bucket, region);

    let builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_region(region)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config());

    let store = builder
        .build()
        .with_context(|| format!("Failed to build S3 client for bucket {}", bucket))?;
    Ok(Arc::new(store))
}

/// Create the store the replication sink writes to.
/// Uses LocalFileSystem if local_path is set, otherwise S3.
pub fn create_sync_store(config: &S3Config) -> Result<Arc<dyn ObjectStore>> {
    match (&config.local_path, &config.bucket) {
        (Some(local_path), _) => {
            let path = std::path::Path::new(local_path);
            if !path.exists() {
                std::fs::create_dir_all(path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
            }
            tracing::info!("Creating LocalFileSystem store at: {}", path.display());
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        (_, Some(bucket)) => create_s3_store(bucket, &config.region),
        _ => anyhow::bail!("Invalid config: no s3 destination"),
    }
}

/// Engine settings for one sync run against the configured destination.
pub fn sync_config(config: &S3Config) -> SyncConfig {
    SyncConfig {
        prefix: config.prefix.clone(),
        concurrency: config.concurrency,
        dry_run: config.dry_run,
        max_retry_percent: config.max_retry_percent,
        // The local filesystem store has no user metadata
        write_metadata: !config.is_local(),
    }
}
