//! Configuration for the repo-updated daemon.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Processor names the registry knows how to build.
pub const KNOWN_PROCESSORS: &[&str] = &["pull", "lfs", "s3", "elasticsearch", "tile38", "pubsub"];

/// Main configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one checkout per repository
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Inbound pub/sub connection
    #[serde(default)]
    pub redis: RedisConfig,

    /// Processor names per stage
    #[serde(default)]
    pub pipeline: StagesConfig,

    #[serde(default)]
    pub pull: PullConfig,

    #[serde(default)]
    pub s3: S3Config,

    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,

    #[serde(default)]
    pub tile38: Tile38Config,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub processing: ProcessingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            redis: RedisConfig::default(),
            pipeline: StagesConfig::default(),
            pull: PullConfig::default(),
            s3: S3Config::default(),
            elasticsearch: ElasticsearchConfig::default(),
            tile38: Tile38Config::default(),
            relay: RelayConfig::default(),
            processing: ProcessingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Redis pub/sub endpoint carrying change notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_localhost")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Channel the daemon subscribes to
    #[serde(default = "default_redis_channel")]
    pub channel: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_localhost(),
            port: default_redis_port(),
            channel: default_redis_channel(),
        }
    }
}

impl RedisConfig {
    /// Connection URL in the form the redis client expects.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

/// Which processors run in which stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Run in order before anything else; the first failure aborts the task
    #[serde(default = "default_pre")]
    pub pre: Vec<String>,

    /// Run concurrently, failures are isolated
    #[serde(rename = "async", default = "default_async")]
    pub async_stage: Vec<String>,

    /// Run in order once the async stage has joined
    #[serde(default)]
    pub post: Vec<String>,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            pre: default_pre(),
            async_stage: default_async(),
            post: Vec::new(),
        }
    }
}

impl StagesConfig {
    /// Every configured name, pre then async then post.
    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.pre
            .iter()
            .chain(self.async_stage.iter())
            .chain(self.post.iter())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.all().any(|n| n == name)
    }
}

/// Git pull sink. `git_bin` is also used by the lfs sink and the replay command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    #[serde(default = "default_git_bin")]
    pub git_bin: String,

    #[serde(default = "default_remote")]
    pub remote: String,

    #[serde(default = "default_branch")]
    pub branch: String,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            git_bin: default_git_bin(),
            remote: default_remote(),
            branch: default_branch(),
        }
    }
}

/// Object storage replication sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Local filesystem destination. Mutually exclusive with bucket.
    #[serde(default)]
    pub local_path: Option<String>,

    /// Destination bucket (credentials come from the environment)
    #[serde(default)]
    pub bucket: Option<String>,

    /// Key prefix objects are written under
    #[serde(default)]
    pub prefix: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Concurrent transfers per sync run
    #[serde(default = "default_sync_concurrency")]
    pub concurrency: usize,

    /// Failed transfers, as a percentage of scheduled ones, above which retries are abandoned
    #[serde(default = "default_max_retry_percent")]
    pub max_retry_percent: f64,

    /// Compare and log, but never upload
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            local_path: None,
            bucket: None,
            prefix: String::new(),
            region: default_region(),
            concurrency: default_sync_concurrency(),
            max_retry_percent: default_max_retry_percent(),
            dry_run: false,
        }
    }
}

impl S3Config {
    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }

    /// Destination as a display string (local path or s3:// URI).
    pub fn destination_display(&self) -> String {
        match (&self.local_path, &self.bucket) {
            (Some(path), _) => path.clone(),
            (None, Some(bucket)) => format!("s3://{}/{}", bucket, self.prefix),
            (None, None) => "<unset>".to_string(),
        }
    }
}

/// Search index sink, driven through an external bulk index tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    #[serde(default = "default_localhost")]
    pub host: String,

    #[serde(default = "default_es_port")]
    pub port: u16,

    #[serde(default = "default_es_index")]
    pub index: String,

    /// Executable invoked with `--host --port --index <file list>`
    #[serde(default = "default_index_tool")]
    pub index_tool: PathBuf,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            host: default_localhost(),
            port: default_es_port(),
            index: default_es_index(),
            index_tool: default_index_tool(),
        }
    }
}

/// Geospatial index sink speaking RESP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tile38Config {
    #[serde(default = "default_localhost")]
    pub host: String,

    #[serde(default = "default_tile38_port")]
    pub port: u16,

    #[serde(default = "default_tile38_collection")]
    pub collection: String,
}

impl Default for Tile38Config {
    fn default() -> Self {
        Self {
            host: default_localhost(),
            port: default_tile38_port(),
            collection: default_tile38_collection(),
        }
    }
}

impl Tile38Config {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

/// Outbound relay channel. Published on the inbound redis server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_channel")]
    pub channel: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel: default_relay_channel(),
        }
    }
}

/// Runtime behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Seconds between flush sweeps of every processor
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Tasks allowed through the pipeline at once
    #[serde(default = "default_task_concurrency")]
    pub task_concurrency: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Seconds between sync status lines during one-shot sync commands
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval(),
            task_concurrency: default_task_concurrency(),
            worker_threads: None,
            status_interval_secs: default_status_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for name in self.pipeline.all() {
            if !KNOWN_PROCESSORS.contains(&name) {
                anyhow::bail!(
                    "Unknown processor '{}' (expected one of: {})",
                    name,
                    KNOWN_PROCESSORS.join(", ")
                );
            }
            if !seen.insert(name) {
                anyhow::bail!("Processor '{}' appears more than once in the pipeline", name);
            }
        }
        if seen.is_empty() {
            anyhow::bail!("Pipeline has no processors");
        }

        if self.processing.flush_interval_secs == 0 {
            anyhow::bail!("Flush interval must be > 0");
        }
        if self.processing.task_concurrency == 0 {
            anyhow::bail!("Task concurrency must be > 0");
        }
        if self.processing.status_interval_secs == 0 {
            anyhow::bail!("Status interval must be > 0");
        }

        if self.s3.concurrency == 0 {
            anyhow::bail!("S3 concurrency must be > 0");
        }
        if !(0.0..=100.0).contains(&self.s3.max_retry_percent) {
            anyhow::bail!("Max retry percent must be between 0 and 100");
        }
        if self.pipeline.contains("s3") {
            self.validate_s3_destination()?;
        }

        Ok(())
    }

    /// Exactly one of `s3.local_path` and `s3.bucket` must be set.
    pub fn validate_s3_destination(&self) -> anyhow::Result<()> {
        match (&self.s3.local_path, &self.s3.bucket) {
            (Some(_), Some(_)) => anyhow::bail!("Cannot specify both s3.local_path and s3.bucket"),
            (None, None) => anyhow::bail!("Must specify either s3.local_path or s3.bucket"),
            _ => Ok(()),
        }
    }
}

// Default value functions for serde
fn default_data_root() -> PathBuf { PathBuf::from("/usr/local/data") }
fn default_localhost() -> String { "localhost".to_string() }
fn default_redis_port() -> u16 { 6379 }
fn default_redis_channel() -> String { "updated".to_string() }
fn default_pre() -> Vec<String> { vec!["pull".to_string()] }
fn default_async() -> Vec<String> { vec!["s3".to_string(), "elasticsearch".to_string()] }
fn default_git_bin() -> String { "git".to_string() }
fn default_remote() -> String { "origin".to_string() }
fn default_branch() -> String { "master".to_string() }
fn default_region() -> String { "us-east-1".to_string() }
fn default_sync_concurrency() -> usize { 10 }
fn default_max_retry_percent() -> f64 { 25.0 }
fn default_es_port() -> u16 { 9200 }
fn default_es_index() -> String { "whosonfirst".to_string() }
fn default_index_tool() -> PathBuf { PathBuf::from("/usr/local/bin/wof-es-index-filelist") }
fn default_tile38_port() -> u16 { 9851 }
fn default_tile38_collection() -> String { "whosonfirst".to_string() }
fn default_relay_channel() -> String { "updated-relay".to_string() }
fn default_flush_interval() -> u64 { 30 }
fn default_task_concurrency() -> usize { 16 }
fn default_status_interval() -> u64 { 10 }
fn default_log_level() -> String { "info".to_string() }
