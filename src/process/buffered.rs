//! Processors that buffer paths per repository and run one repo at a time.
//!
//! ```text
//! process_task ──▶ accumulate paths ──▶ process_repo ──┬─ locked? ──▶ schedule (deferred)
//!                                                      └─ lock ──▶ drain paths ──▶ sink ──▶ release
//! flush ──▶ RepoQueue::pending() ──▶ process_repo (concurrently, joined)
//! ```
//!
//! The sink only sees deduplicated path lists and never runs twice at once
//! for the same repository.

use super::Processor;
use crate::queue::{QueueError, RepoGuard, RepoQueue};
use crate::task::Task;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// The action a buffered processor runs over one repository.
#[async_trait]
pub trait RepoSink: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Whether `path` in `repo` should be buffered at all.
    fn accept(&self, _repo: &str, _path: &str) -> bool {
        true
    }

    /// Run even when no paths have been buffered.
    fn runs_without_paths(&self) -> bool {
        false
    }

    /// Handle every buffered path for `repo`. Paths are unique, in arrival order.
    async fn process(&self, repo: &str, paths: &[String]) -> Result<()>;
}

/// A sink failure that happened before any work was handed off.
///
/// The paths go back into the buffer and the repo is scheduled, so the
/// next flush tries them again.
#[derive(Debug, Error)]
#[error("{0:#}")]
pub struct NotStarted(anyhow::Error);

impl NotStarted {
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self(error.into())
    }
}

#[derive(Debug, Default)]
struct BufferState {
    files: HashMap<String, Vec<String>>,
    flushing: bool,
}

/// Clears the flushing flag when the sweep ends, however it ends.
struct FlushGuard<'a> {
    state: &'a Mutex<BufferState>,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().flushing = false;
    }
}

/// A [`Processor`] built from a [`RepoSink`], a [`RepoQueue`] and a path buffer.
pub struct RepoProcessor<S> {
    queue: Arc<RepoQueue>,
    state: Mutex<BufferState>,
    sink: S,
}

impl<S: RepoSink> RepoProcessor<S> {
    pub fn new(sink: S) -> Self {
        Self {
            queue: Arc::new(RepoQueue::new()),
            state: Mutex::new(BufferState::default()),
            sink,
        }
    }

    pub fn queue(&self) -> &Arc<RepoQueue> {
        &self.queue
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Number of paths buffered for `repo`, duplicates included.
    pub fn buffered(&self, repo: &str) -> usize {
        self.state.lock().files.get(repo).map_or(0, Vec::len)
    }

    /// Run `repo` now, or defer it if another run holds the lock.
    pub async fn process_repo(&self, repo: &str) -> Result<()> {
        let _guard = match RepoGuard::acquire(&self.queue, repo) {
            Ok(guard) => guard,
            Err(QueueError::AlreadyProcessing(_)) => {
                tracing::debug!("{} is busy with {}, scheduling", self.sink.name(), repo);
                self.queue.schedule(repo);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let paths = self.take_paths(repo);
        if paths.is_empty() && !self.sink.runs_without_paths() {
            return Ok(());
        }

        let start = Instant::now();
        let result = self.sink.process(repo, &paths).await;
        tracing::info!("Time to process ({}) {}: {:?}", self.sink.name(), repo, start.elapsed());

        if let Err(e) = &result {
            if e.is::<NotStarted>() {
                tracing::warn!(
                    "{} could not start {}, keeping {} paths for the next flush",
                    self.sink.name(),
                    repo,
                    paths.len()
                );
                self.restore_paths(repo, paths);
                self.queue.schedule(repo);
            }
        }

        result.with_context(|| format!("{} failed for {}", self.sink.name(), repo))
    }

    fn buffer(&self, task: &Task) {
        let accepted: Vec<String> = task
            .paths()
            .iter()
            .filter(|path| self.sink.accept(task.repo(), path))
            .cloned()
            .collect();

        let mut state = self.state.lock();
        state
            .files
            .entry(task.repo().to_string())
            .or_default()
            .extend(accepted);
    }

    /// Put drained paths back ahead of anything buffered since.
    fn restore_paths(&self, repo: &str, mut paths: Vec<String>) {
        let mut state = self.state.lock();
        let files = state.files.entry(repo.to_string()).or_default();
        paths.append(files);
        *files = paths;
    }

    fn take_paths(&self, repo: &str) -> Vec<String> {
        let files = self.state.lock().files.remove(repo).unwrap_or_default();

        let mut seen = HashSet::new();
        files.into_iter().filter(|path| seen.insert(path.clone())).collect()
    }
}

#[async_trait]
impl<S: RepoSink> Processor for RepoProcessor<S> {
    fn name(&self) -> &str {
        self.sink.name()
    }

    async fn process_task(&self, task: &Task) -> Result<()> {
        self.buffer(task);
        self.process_repo(task.repo()).await
    }

    async fn flush(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.flushing {
                return Ok(());
            }
            state.flushing = true;
        }
        let _flushing = FlushGuard { state: &self.state };

        let pending = self.queue.pending();
        if pending.is_empty() {
            return Ok(());
        }

        tracing::debug!("Flushing {} pending repos for {}", pending.len(), self.sink.name());

        let results = join_all(pending.iter().map(|repo| self.process_repo(repo))).await;
        for (repo, result) in pending.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!("Flush of {} for {} failed: {:#}", repo, self.sink.name(), e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
        delay_ms: u64,
        fail: bool,
        not_started: AtomicBool,
        always_run: bool,
        gate: Option<Arc<Notify>>,
        gated_repo: &'static str,
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl RepoSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        fn accept(&self, _repo: &str, path: &str) -> bool {
            !path.ends_with(".skip")
        }

        fn runs_without_paths(&self) -> bool {
            self.always_run
        }

        async fn process(&self, repo: &str, paths: &[String]) -> Result<()> {
            if self.not_started.load(Ordering::SeqCst) {
                return Err(NotStarted::new(anyhow::anyhow!("no scratch space")).into());
            }

            if let Some(gate) = self.gate.as_ref().filter(|_| repo == self.gated_repo) {
                self.entered.notify_one();
                gate.notified().await;
            }

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);

            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.calls.lock().push((repo.to_string(), paths.to_vec()));
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                anyhow::bail!("sink exploded");
            }
            Ok(())
        }
    }

    fn task(repo: &str, paths: &[&str]) -> Task {
        Task::new("c1", repo, paths.iter().map(|p| p.to_string()).collect())
    }

    /// Buffer `path` for `repo` while the repo is locked, leaving it pending.
    async fn defer(processor: &RepoProcessor<RecordingSink>, repo: &str, path: &str) {
        processor.queue().lock(repo).unwrap();
        processor.process_task(&task(repo, &[path])).await.unwrap();
        processor.queue().release(repo).unwrap();
    }

    fn calls(processor: &RepoProcessor<RecordingSink>) -> Vec<(String, Vec<String>)> {
        processor.sink().calls.lock().clone()
    }

    #[tokio::test]
    async fn test_paths_are_deduped_and_filtered() {
        let processor = RepoProcessor::new(RecordingSink::default());

        processor
            .process_task(&task("repo", &["a.geojson", "b.geojson", "a.geojson", "c.skip"]))
            .await
            .unwrap();

        assert_eq!(
            calls(&processor),
            vec![("repo".to_string(), vec!["a.geojson".to_string(), "b.geojson".to_string()])]
        );
        assert_eq!(processor.buffered("repo"), 0);
        assert!(!processor.queue().is_processing("repo"));
    }

    #[tokio::test]
    async fn test_empty_buffer_skips_sink() {
        let processor = RepoProcessor::new(RecordingSink::default());
        processor.process_task(&task("repo", &["only.skip"])).await.unwrap();
        assert!(calls(&processor).is_empty());

        let always = RepoProcessor::new(RecordingSink {
            always_run: true,
            ..Default::default()
        });
        always.process_task(&task("repo", &[])).await.unwrap();
        assert_eq!(calls(&always), vec![("repo".to_string(), Vec::new())]);
    }

    #[tokio::test]
    async fn test_locked_repo_is_deferred() {
        let processor = RepoProcessor::new(RecordingSink::default());
        processor.queue().lock("repo").unwrap();

        processor.process_task(&task("repo", &["a.geojson"])).await.unwrap();

        assert!(calls(&processor).is_empty());
        assert_eq!(processor.queue().pending_count("repo"), 1);
        assert_eq!(processor.buffered("repo"), 1);

        // Release alone does not run the deferred work
        processor.queue().release("repo").unwrap();
        assert!(calls(&processor).is_empty());

        processor.flush().await.unwrap();
        assert_eq!(calls(&processor), vec![("repo".to_string(), vec!["a.geojson".to_string()])]);
        assert!(processor.queue().pending().is_empty());
    }

    #[tokio::test]
    async fn test_failure_still_releases() {
        let processor = RepoProcessor::new(RecordingSink {
            fail: true,
            ..Default::default()
        });

        let result = processor.process_task(&task("repo", &["a.geojson"])).await;

        assert!(result.is_err());
        assert!(!processor.queue().is_processing("repo"));
        assert_eq!(processor.buffered("repo"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_concurrent_runs_per_repo() {
        let processor = Arc::new(RepoProcessor::new(RecordingSink {
            delay_ms: 20,
            ..Default::default()
        }));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let processor = Arc::clone(&processor);
                tokio::spawn(async move {
                    let path = format!("{}.geojson", i);
                    processor.process_task(&task("repo", &[&path])).await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Drain anything deferred while the repo was busy
        processor.flush().await.unwrap();

        assert_eq!(processor.sink().max_running.load(Ordering::SeqCst), 1);
        let processed: usize = calls(&processor).iter().map(|(_, paths)| paths.len()).sum();
        assert_eq!(processed, 8);
    }

    #[tokio::test]
    async fn test_paths_kept_when_sink_cannot_start() {
        let processor = RepoProcessor::new(RecordingSink::default());
        processor.sink().not_started.store(true, Ordering::SeqCst);

        let result = processor
            .process_task(&task("repo", &["a.geojson", "b.geojson", "a.geojson"]))
            .await;

        assert!(result.is_err());
        assert!(!processor.queue().is_processing("repo"));
        assert_eq!(processor.buffered("repo"), 2);
        assert_eq!(processor.queue().pending(), vec!["repo".to_string()]);

        // Newer paths queue up behind the restored ones
        processor.queue().lock("repo").unwrap();
        processor.process_task(&task("repo", &["c.geojson"])).await.unwrap();
        processor.queue().release("repo").unwrap();

        processor.sink().not_started.store(false, Ordering::SeqCst);
        processor.flush().await.unwrap();

        assert_eq!(
            calls(&processor),
            vec![(
                "repo".to_string(),
                vec!["a.geojson".to_string(), "b.geojson".to_string(), "c.geojson".to_string()]
            )]
        );
        assert!(processor.queue().pending().is_empty());
    }

    #[tokio::test]
    async fn test_flush_while_sweeping_returns_immediately() {
        let gate = Arc::new(Notify::new());
        let processor = Arc::new(RepoProcessor::new(RecordingSink {
            gate: Some(Arc::clone(&gate)),
            gated_repo: "a",
            ..Default::default()
        }));

        defer(&processor, "a", "1.geojson").await;

        let sweeping = Arc::clone(&processor);
        let first = tokio::spawn(async move { sweeping.flush().await });
        processor.sink().entered.notified().await;

        // The first sweep is parked inside the sink for "a"
        defer(&processor, "b", "2.geojson").await;
        assert_eq!(processor.queue().pending(), vec!["b".to_string()]);

        processor.flush().await.unwrap();
        assert!(calls(&processor).is_empty());
        assert_eq!(processor.queue().pending(), vec!["b".to_string()]);

        gate.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(calls(&processor), vec![("a".to_string(), vec!["1.geojson".to_string()])]);

        // The flag is cleared once the sweep ends
        processor.flush().await.unwrap();
        assert_eq!(
            calls(&processor),
            vec![
                ("a".to_string(), vec!["1.geojson".to_string()]),
                ("b".to_string(), vec!["2.geojson".to_string()]),
            ]
        );
    }
}
