//! Bring a repository checkout up to date with `git pull`.

use super::RepoSink;
use crate::config::PullConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;

pub struct PullSink {
    data_root: PathBuf,
    config: PullConfig,
}

impl PullSink {
    pub fn new(data_root: PathBuf, config: PullConfig) -> Self {
        Self { data_root, config }
    }

    fn command(&self, repo: &str) -> Command {
        let root = self.data_root.join(repo);

        let mut cmd = Command::new(&self.config.git_bin);
        cmd.arg(format!("--git-dir={}", root.join(".git").display()))
            .arg(format!("--work-tree={}", root.display()))
            .arg("pull")
            .arg(&self.config.remote)
            .arg(&self.config.branch);
        cmd
    }
}

#[async_trait]
impl RepoSink for PullSink {
    fn name(&self) -> &str {
        "pull"
    }

    // A notification means the remote moved, whatever paths it names
    fn runs_without_paths(&self) -> bool {
        true
    }

    async fn process(&self, repo: &str, _paths: &[String]) -> Result<()> {
        let root = self.data_root.join(repo);
        if !root.is_dir() {
            anyhow::bail!("Can't find repo {}", root.display());
        }

        let output = self
            .command(repo)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.config.git_bin))?;

        if !output.status.success() {
            anyhow::bail!(
                "Failed to pull {} from {}/{} ({}): {}",
                repo,
                self.config.remote,
                self.config.branch,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        tracing::debug!("{}", String::from_utf8_lossy(&output.stdout).trim());
        Ok(())
    }
}
