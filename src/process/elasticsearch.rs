//! Index changed files with an external bulk index tool.

use super::{NotStarted, RepoSink};
use crate::config::ElasticsearchConfig;
use crate::io::write_file_list;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

pub struct ElasticsearchSink {
    data_root: PathBuf,
    config: ElasticsearchConfig,
}

impl ElasticsearchSink {
    pub fn new(data_root: PathBuf, config: ElasticsearchConfig) -> Self {
        Self { data_root, config }
    }

    /// Fail early if the index tool is not there.
    pub fn check_index_tool(&self) -> Result<()> {
        let tool = &self.config.index_tool;
        if !tool.is_file() {
            anyhow::bail!("Index tool {} does not exist", tool.display());
        }
        Ok(())
    }

    fn command(&self, list: &Path) -> Command {
        let mut cmd = Command::new(&self.config.index_tool);
        cmd.arg("--host")
            .arg(&self.config.host)
            .arg("--port")
            .arg(self.config.port.to_string())
            .arg("--index")
            .arg(&self.config.index)
            .arg(list);
        cmd
    }
}

#[async_trait]
impl RepoSink for ElasticsearchSink {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    async fn process(&self, repo: &str, paths: &[String]) -> Result<()> {
        let root = self.data_root.join(repo);
        if !root.is_dir() {
            anyhow::bail!("Can't find repo {}", root.display());
        }

        let list = write_file_list(paths, &root).map_err(NotStarted::new)?;
        let mut cmd = self.command(list.path());
        tracing::debug!("{:?}", cmd.as_std());

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.config.index_tool.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "Failed to index {} ({}): {}",
                repo,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }
}
