//! Fetch and check out Git LFS objects for a repository checkout.

use super::RepoSink;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// `git lfs` subcommands, run in order inside the checkout.
const LFS_STEPS: &[&str] = &["fetch", "checkout"];

pub struct LfsSink {
    data_root: PathBuf,
    git_bin: String,
}

impl LfsSink {
    pub fn new(data_root: PathBuf, git_bin: impl Into<String>) -> Self {
        Self {
            data_root,
            git_bin: git_bin.into(),
        }
    }

    fn command(&self, root: &Path, step: &str) -> Command {
        let mut cmd = Command::new(&self.git_bin);
        cmd.arg("lfs").arg(step).current_dir(root);
        cmd
    }
}

#[async_trait]
impl RepoSink for LfsSink {
    fn name(&self) -> &str {
        "lfs"
    }

    fn runs_without_paths(&self) -> bool {
        true
    }

    async fn process(&self, repo: &str, _paths: &[String]) -> Result<()> {
        let root = self.data_root.join(repo);
        if !root.is_dir() {
            anyhow::bail!("Can't find repo {}", root.display());
        }

        for step in LFS_STEPS {
            let output = self
                .command(&root, step)
                .output()
                .await
                .with_context(|| format!("Failed to run {} lfs {}", self.git_bin, step))?;

            if !output.status.success() {
                anyhow::bail!(
                    "git lfs {} failed for {} ({}): {}",
                    step,
                    repo,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            tracing::debug!("git lfs {} {}: {:?}", step, repo, output.status);
        }

        Ok(())
    }
}
