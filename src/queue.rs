//! Per-repository mutual exclusion with pending-work accounting.
//!
//! Every buffered processor owns one [`RepoQueue`]. A key is either idle or
//! locked by exactly one run; work that shows up while the key is locked is
//! counted as pending and picked up by the next flush sweep.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Scheduling conflicts reported by [`RepoQueue`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("{0} is already being processed")]
    AlreadyProcessing(String),

    #[error("{0} is not being processed")]
    NotProcessing(String),
}

#[derive(Debug, Default)]
struct State {
    pending: HashMap<String, u64>,
    processing: HashSet<String>,
}

/// Tracks which repositories are locked and how much work is waiting on each.
#[derive(Debug, Default)]
pub struct RepoQueue {
    state: Mutex<State>,
}

impl RepoQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that `key` has work waiting.
    pub fn schedule(&self, key: &str) {
        let mut state = self.state.lock();
        *state.pending.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Claim `key` for a processing run.
    ///
    /// A successful lock clears the key's pending count: the run it guards
    /// drains everything accumulated up to this point.
    pub fn lock(&self, key: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();

        if state.processing.contains(key) {
            return Err(QueueError::AlreadyProcessing(key.to_string()));
        }

        state.processing.insert(key.to_string());
        if let Some(count) = state.pending.get_mut(key) {
            *count = 0;
        }

        Ok(())
    }

    /// Give `key` back. Pending work stays queued for the next flush.
    pub fn release(&self, key: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();

        if !state.processing.remove(key) {
            return Err(QueueError::NotProcessing(key.to_string()));
        }

        Ok(())
    }

    pub fn is_processing(&self, key: &str) -> bool {
        self.state.lock().processing.contains(key)
    }

    /// Keys with pending work that nobody is currently processing.
    pub fn pending(&self) -> Vec<String> {
        let state = self.state.lock();

        let mut keys: Vec<String> = state
            .pending
            .iter()
            .filter(|(key, count)| **count > 0 && !state.processing.contains(*key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn pending_count(&self, key: &str) -> u64 {
        self.state.lock().pending.get(key).copied().unwrap_or(0)
    }
}

/// Lock on one key of a shared queue, released when dropped.
pub struct RepoGuard {
    queue: Arc<RepoQueue>,
    key: String,
}

impl RepoGuard {
    /// Lock `key`, or report that another run already holds it.
    pub fn acquire(queue: &Arc<RepoQueue>, key: &str) -> Result<Self, QueueError> {
        queue.lock(key)?;
        Ok(Self {
            queue: Arc::clone(queue),
            key: key.to_string(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RepoGuard {
    fn drop(&mut self) {
        if let Err(e) = self.queue.release(&self.key) {
            tracing::error!("Failed to release {}: {}", self.key, e);
        }
    }
}
