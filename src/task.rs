//! Normalized unit of work handed to every processor.

use std::fmt;

/// One repository, one change batch, the paths it touched.
///
/// Paths are repository-relative and may repeat; processors dedupe when they
/// consume their accumulated lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    change_id: String,
    repo: String,
    paths: Vec<String>,
}

impl Task {
    /// Create a new task.
    pub fn new(change_id: impl Into<String>, repo: impl Into<String>, paths: Vec<String>) -> Self {
        Self {
            change_id: change_id.into(),
            repo: repo.into(),
            paths,
        }
    }

    /// Identifier of the change batch (usually a commit hash).
    pub fn change_id(&self) -> &str {
        &self.change_id
    }

    /// Repository key used for per-repo serialization.
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Changed paths, in arrival order.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.paths.len() {
            1 => write!(f, "{}#{} (1 file)", self.change_id, self.repo),
            n => write!(f, "{}#{} ({} files)", self.change_id, self.repo, n),
        }
    }
}
