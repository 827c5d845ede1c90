//! repo-updated CLI
//!
//! Listens for repository change notifications and fans them out to the
//! configured processors.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repo_updated::replay::CommitRange;
use repo_updated::{build_runtime, publish, replay, run_daemon, run_sync, Config, SyncSource};

#[derive(Parser)]
#[command(name = "repo-updated")]
#[command(about = "Fan repository change notifications out to sync and index sinks", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Log filter used when RUST_LOG is unset (overrides logging.level)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Compare and log, but never upload or publish
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default if no command specified)
    Run,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },

    /// Publish a change notification for `repo#path` entries
    Publish {
        /// Entries in the form repo#path
        #[arg(required = true)]
        entries: Vec<String>,

        /// Change identifier shared by every row
        #[arg(long, default_value = "atomic-update")]
        change_id: String,
    },

    /// Publish the record changes of a commit range as one notification
    Replay {
        /// Repository checkout; its directory name is the repo name
        #[arg(long)]
        repo: PathBuf,

        /// First commit to replay (default: the whole history)
        #[arg(long)]
        start_commit: Option<String>,

        /// Last commit to replay (default: HEAD)
        #[arg(long, requires = "start_commit")]
        stop_commit: Option<String>,
    },

    /// Replicate a list of files to the configured destination
    SyncFiles {
        /// Directory paths are resolved against and keys are relative to
        #[arg(long)]
        root: PathBuf,

        /// Newline-delimited list of paths to sync
        #[arg(long, conflicts_with = "paths")]
        file_list: Option<PathBuf>,

        /// Paths to sync
        paths: Vec<String>,
    },

    /// Replicate every file under a directory
    SyncDir {
        /// Directory to sync
        #[arg(long)]
        root: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli);

    match cli.command {
        None | Some(Commands::Run) => {
            run_command(&cli.config, cli.dry_run)?;
        }

        Some(Commands::Validate) => {
            validate_command(&cli.config)?;
        }

        Some(Commands::GenerateConfig { ref output }) => {
            generate_config_command(output)?;
        }

        Some(Commands::Publish {
            ref entries,
            ref change_id,
        }) => {
            publish_command(&cli.config, change_id, entries, cli.dry_run)?;
        }

        Some(Commands::Replay {
            ref repo,
            ref start_commit,
            ref stop_commit,
        }) => {
            let range = CommitRange {
                start: start_commit.clone(),
                stop: stop_commit.clone(),
            };
            replay_command(&cli.config, repo, &range, cli.dry_run)?;
        }

        Some(Commands::SyncFiles {
            ref root,
            ref file_list,
            ref paths,
        }) => {
            let source = match file_list {
                Some(list) => SyncSource::FileList(list.clone()),
                None if paths.is_empty() => anyhow::bail!("Nothing to sync: pass paths or --file-list"),
                None => SyncSource::Paths(paths.clone()),
            };
            sync_command(&cli.config, root, source, cli.dry_run)?;
        }

        Some(Commands::SyncDir { ref root }) => {
            sync_command(&cli.config, root, SyncSource::Directory, cli.dry_run)?;
        }
    }

    Ok(())
}

/// RUST_LOG wins, then `--log-level`, then `logging.level` from the config file.
fn init_logging(cli: &Cli) {
    let level = cli
        .log_level
        .clone()
        .or_else(|| Config::from_file(&cli.config).ok().map(|c| c.logging.level))
        .unwrap_or_else(|| "info".to_string());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

fn run_command(config_path: &Path, dry_run: bool) -> Result<()> {
    let mut config = Config::from_file(config_path)?;

    if dry_run {
        config.s3.dry_run = true;
    }

    config.validate()?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    runtime.block_on(async { run_daemon(config).await })?;

    Ok(())
}

fn validate_command(config_path: &Path) -> Result<()> {
    let config = Config::from_file(config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

/// Publishing only needs the redis section, so a missing file means defaults.
fn load_or_default(config_path: &Path) -> Result<Config> {
    if config_path.exists() {
        Config::from_file(config_path)
    } else {
        tracing::debug!("No config at {}, using defaults", config_path.display());
        Ok(Config::default())
    }
}

fn publish_command(config_path: &Path, change_id: &str, entries: &[String], dry_run: bool) -> Result<()> {
    let config = load_or_default(config_path)?;

    let runtime = build_runtime(None)?;
    let payload = runtime.block_on(publish(&config, change_id, entries, dry_run))?;

    if dry_run {
        println!("{}", payload);
    }

    Ok(())
}

fn replay_command(config_path: &Path, repo: &Path, range: &CommitRange, dry_run: bool) -> Result<()> {
    let config = load_or_default(config_path)?;

    let runtime = build_runtime(None)?;
    let payload = runtime.block_on(replay(&config, repo, range, dry_run))?;

    if dry_run {
        println!("{}", payload);
    }

    Ok(())
}

fn sync_command(config_path: &Path, root: &Path, source: SyncSource, dry_run: bool) -> Result<()> {
    let mut config = Config::from_file(config_path)?;

    if dry_run {
        config.s3.dry_run = true;
    }

    let runtime = build_runtime(config.processing.worker_threads)?;
    let snapshot = runtime.block_on(run_sync(&config, root, source))?;

    println!("{}", snapshot);

    Ok(())
}

fn generate_config_command(output: &Path) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# repo-updated configuration

# One checkout per repository, named after the repository
data_root: "/usr/local/data"

# === INBOUND: where change notifications arrive ===
# Each message is CSV: change_id,repo,path (one row per changed file)
redis:
  host: "localhost"
  port: 6379
  channel: "updated"

# === PIPELINE: which processors run when ===
# pre:   in order, the first failure skips everything else for that task
# async: side by side, failures are isolated
# post:  in order, after the async stage has finished
# Known processors: pull, lfs, s3, elasticsearch, tile38, pubsub
pipeline:
  pre: ["pull"]
  async: ["s3", "elasticsearch"]
  post: []

# === PULL: update the checkout before anything reads it ===
pull:
  git_bin: "git"
  remote: "origin"
  branch: "master"

# === S3: replicate changed records ===
# Choose ONE of: local_path (local disk) OR bucket (S3)
s3:
  # Option 1: Mirror to the local filesystem
  # local_path: "/tmp/mirror"

  # Option 2: Mirror to S3 (credentials come from the environment)
  bucket: "data.whosonfirst.org"
  prefix: ""
  region: "us-east-1"

  # Concurrent transfers per sync run
  concurrency: 10

  # Abandon retries when more than this percentage of transfers failed
  max_retry_percent: 25.0

  # Compare and log, but never upload
  dry_run: false

# === ELASTICSEARCH: index through an external bulk tool ===
elasticsearch:
  host: "localhost"
  port: 9200
  index: "whosonfirst"
  index_tool: "/usr/local/bin/wof-es-index-filelist"

# === TILE38: geospatial index ===
tile38:
  host: "localhost"
  port: 9851
  collection: "whosonfirst"

# === RELAY: republish changed paths for downstream consumers ===
relay:
  channel: "updated-relay"

# === PROCESSING: runtime tuning ===
processing:
  # Seconds between sweeps that run work deferred while a repo was busy
  flush_interval_secs: 30

  # Tasks allowed through the pipeline at once
  task_concurrency: 16

  # Tokio worker threads (null = num CPUs)
  # worker_threads: 8

  # Seconds between status lines during sync-files and sync-dir
  status_interval_secs: 10

# === LOGGING ===
# Used when RUST_LOG is unset
logging:
  level: "info"
"#;

    std::fs::write(output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
