//! Rebuild change notifications from a repository's git history.
//!
//! `git log --pretty=format:#<hash> --name-only` prints each commit hash on
//! a line starting with `#`, followed by the files it touched. Every record
//! file becomes a `hash,repo,path` row, so one replayed range can carry many
//! change ids.

use crate::coalesce::encode_rows;
use anyhow::{Context, Result};
use std::path::Path;
use tokio::process::Command;

const RECORD_SUFFIX: &str = ".geojson";

/// Commits to replay. Without a start commit the whole history is replayed.
#[derive(Debug, Clone, Default)]
pub struct CommitRange {
    pub start: Option<String>,
    pub stop: Option<String>,
}

impl CommitRange {
    /// Revision argument for `git log`, e.g. `abc^...HEAD`.
    fn revisions(&self) -> Option<String> {
        let start = self.start.as_deref()?;
        let stop = self.stop.as_deref().unwrap_or("HEAD");
        Some(format!("{}^...{}", start, stop))
    }
}

fn log_command(git_bin: &str, repo_root: &Path, range: &CommitRange) -> Command {
    let mut cmd = Command::new(git_bin);
    cmd.arg("log").arg("--pretty=format:#%H").arg("--name-only");
    if let Some(revisions) = range.revisions() {
        cmd.arg(revisions);
    }
    cmd.current_dir(repo_root);
    cmd
}

/// `[hash, repo, path]` rows for every record file in `git log` output.
pub fn parse_log(repo: &str, log: &str) -> Vec<[String; 3]> {
    let mut rows = Vec::new();
    let mut hash: Option<&str> = None;

    for line in log.lines() {
        let line = line.trim();
        if let Some(commit) = line.strip_prefix('#') {
            hash = Some(commit);
            continue;
        }

        if !line.ends_with(RECORD_SUFFIX) {
            continue;
        }

        match hash {
            Some(hash) => rows.push([hash.to_string(), repo.to_string(), line.to_string()]),
            None => tracing::warn!("{} appears before any commit, skipping", line),
        }
    }

    rows
}

/// Run `git log` over `repo_root` and encode the record changes as one payload.
///
/// The repo name in each row is the final component of `repo_root`.
pub async fn replay_payload(git_bin: &str, repo_root: &Path, range: &CommitRange) -> Result<String> {
    if !repo_root.is_dir() {
        anyhow::bail!("Repo {} does not exist", repo_root.display());
    }

    let repo = repo_root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("Can't tell the repo name of {}", repo_root.display()))?;

    let mut cmd = log_command(git_bin, repo_root, range);
    tracing::info!("{:?}", cmd.as_std());

    let output = cmd
        .output()
        .await
        .with_context(|| format!("Failed to run {}", git_bin))?;

    if !output.status.success() {
        anyhow::bail!(
            "git log failed for {} ({}): {}",
            repo,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let rows = parse_log(&repo, &String::from_utf8_lossy(&output.stdout));
    tracing::info!("Replaying {} record changes from {}", rows.len(), repo);

    encode_rows(&rows)
}
