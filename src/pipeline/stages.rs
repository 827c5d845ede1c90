//! Staged execution of one task across every configured processor.
//!
//! ```text
//!            ┌──────────────┐     ┌─────────────────┐     ┌───────────────┐
//!  task ────▶│ pre (in order│────▶│ async (spawned, │────▶│ post (in order│
//!            │  fail-fast)  │     │     joined)     │     │ unconditional)│
//!            └──────────────┘     └─────────────────┘     └───────────────┘
//! ```
//!
//! A pre-stage error aborts the task. Async-stage processors run side by
//! side and their failures are isolated; the post stage runs once they have
//! all finished, whatever they returned.

use crate::config::Config;
use crate::process::{build_processor, Processor};
use crate::task::Task;
use anyhow::Result;
use futures::future::join_all;
use std::sync::Arc;

/// How a task fared in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Every stage ran; `failures` counts processors that returned an error or panicked
    Completed { failures: usize },
    /// A pre-stage processor failed and nothing after it ran
    Aborted { processor: String },
}

/// Ordered processor stages.
pub struct Pipeline {
    pre: Vec<Arc<dyn Processor>>,
    async_stage: Vec<Arc<dyn Processor>>,
    post: Vec<Arc<dyn Processor>>,
}

impl Pipeline {
    pub fn new(
        pre: Vec<Arc<dyn Processor>>,
        async_stage: Vec<Arc<dyn Processor>>,
        post: Vec<Arc<dyn Processor>>,
    ) -> Self {
        Self {
            pre,
            async_stage,
            post,
        }
    }

    /// Build every processor named in `config.pipeline`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let build = |names: &[String]| -> Result<Vec<Arc<dyn Processor>>> {
            names.iter().map(|name| build_processor(name, config)).collect()
        };

        let pipeline = Self::new(
            build(&config.pipeline.pre)?,
            build(&config.pipeline.async_stage)?,
            build(&config.pipeline.post)?,
        );

        if pipeline.is_empty() {
            anyhow::bail!("Pipeline has no processors");
        }

        tracing::info!(
            "Pipeline: pre [{}] async [{}] post [{}]",
            config.pipeline.pre.join(", "),
            config.pipeline.async_stage.join(", "),
            config.pipeline.post.join(", ")
        );

        Ok(pipeline)
    }

    /// Every processor, pre then async then post.
    pub fn processors(&self) -> impl Iterator<Item = &Arc<dyn Processor>> {
        self.pre.iter().chain(self.async_stage.iter()).chain(self.post.iter())
    }

    pub fn len(&self) -> usize {
        self.pre.len() + self.async_stage.len() + self.post.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `task` through all three stages.
    pub async fn run_task(&self, task: Arc<Task>) -> TaskOutcome {
        for processor in &self.pre {
            if let Err(e) = processor.process_task(&task).await {
                tracing::error!(
                    "Pre-stage processor {} failed for {}, skipping remaining stages: {:#}",
                    processor.name(),
                    task,
                    e
                );
                return TaskOutcome::Aborted {
                    processor: processor.name().to_string(),
                };
            }
        }

        let mut failures = 0;

        let handles: Vec<_> = self
            .async_stage
            .iter()
            .map(|processor| {
                let processor = Arc::clone(processor);
                let task = Arc::clone(&task);
                tokio::spawn(async move { processor.process_task(&task).await })
            })
            .collect();

        for (processor, result) in self.async_stage.iter().zip(join_all(handles).await) {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("Processor {} failed for {}: {:#}", processor.name(), task, e);
                    failures += 1;
                }
                Err(e) => {
                    tracing::error!("Processor {} panicked for {}: {}", processor.name(), task, e);
                    failures += 1;
                }
            }
        }

        for processor in &self.post {
            if let Err(e) = processor.process_task(&task).await {
                tracing::error!("Post-stage processor {} failed for {}: {:#}", processor.name(), task, e);
                failures += 1;
            }
        }

        TaskOutcome::Completed { failures }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Barrier;

    pub(crate) type Log = Arc<Mutex<Vec<String>>>;

    /// Appends its name to a shared log for every task and flush.
    pub(crate) struct RecordingProcessor {
        pub name: String,
        pub log: Log,
        pub fail: bool,
        pub panic: bool,
        pub delay_ms: u64,
        pub barrier: Option<Arc<Barrier>>,
        pub flushes: AtomicUsize,
        pub running: AtomicUsize,
        pub max_running: AtomicUsize,
    }

    impl RecordingProcessor {
        pub(crate) fn new(name: &str, log: &Log) -> Self {
            Self {
                name: name.to_string(),
                log: Arc::clone(log),
                fail: false,
                panic: false,
                delay_ms: 0,
                barrier: None,
                flushes: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            }
        }

        pub(crate) fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait]
    impl Processor for RecordingProcessor {
        fn name(&self) -> &str {
            &self.name
        }

        async fn process_task(&self, _task: &Task) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);

            if let Some(barrier) = &self.barrier {
                barrier.wait().await;
            }
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            self.log.lock().push(self.name.clone());

            if self.panic {
                panic!("{} panicked", self.name);
            }
            if self.fail {
                anyhow::bail!("{} failed", self.name);
            }
            Ok(())
        }

        async fn flush(&self) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn arc(p: RecordingProcessor) -> Arc<dyn Processor> {
        Arc::new(p)
    }

    fn task() -> Arc<Task> {
        Arc::new(Task::new("c1", "repoA", vec!["data/1.json".to_string()]))
    }

    #[tokio::test]
    async fn test_pre_failure_aborts_task() {
        let log = Log::default();
        let pipeline = Pipeline::new(
            vec![
                arc(RecordingProcessor::new("a", &log)),
                arc(RecordingProcessor::new("b", &log).failing()),
                arc(RecordingProcessor::new("c", &log)),
            ],
            vec![arc(RecordingProcessor::new("d", &log))],
            vec![arc(RecordingProcessor::new("e", &log))],
        );

        let outcome = pipeline.run_task(task()).await;

        assert_eq!(
            outcome,
            TaskOutcome::Aborted {
                processor: "b".to_string()
            }
        );
        assert_eq!(*log.lock(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_async_failures_are_isolated() {
        let log = Log::default();
        let pipeline = Pipeline::new(
            vec![arc(RecordingProcessor::new("pre", &log))],
            vec![
                arc(RecordingProcessor::new("x", &log).failing()),
                arc(RecordingProcessor::new("y", &log)),
            ],
            vec![arc(RecordingProcessor::new("post", &log))],
        );

        let outcome = pipeline.run_task(task()).await;

        assert_eq!(outcome, TaskOutcome::Completed { failures: 1 });
        let log = log.lock().clone();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0], "pre");
        assert!(log.contains(&"x".to_string()));
        assert!(log.contains(&"y".to_string()));
        assert_eq!(log[3], "post");
    }

    #[tokio::test]
    async fn test_async_stage_runs_concurrently() {
        let log = Log::default();
        let barrier = Arc::new(Barrier::new(2));

        let mut first = RecordingProcessor::new("first", &log);
        first.barrier = Some(Arc::clone(&barrier));
        let mut second = RecordingProcessor::new("second", &log);
        second.barrier = Some(barrier);

        let pipeline = Pipeline::new(Vec::new(), vec![arc(first), arc(second)], Vec::new());

        // Each processor waits for the other, so a sequential stage would hang
        let outcome = tokio::time::timeout(Duration::from_secs(5), pipeline.run_task(task()))
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Completed { failures: 0 });
    }

    #[tokio::test]
    async fn test_panicking_processor_does_not_stop_post() {
        let log = Log::default();
        let mut panicky = RecordingProcessor::new("panicky", &log);
        panicky.panic = true;

        let pipeline = Pipeline::new(
            Vec::new(),
            vec![arc(panicky)],
            vec![
                arc(RecordingProcessor::new("post-1", &log).failing()),
                arc(RecordingProcessor::new("post-2", &log)),
            ],
        );

        let outcome = pipeline.run_task(task()).await;

        assert_eq!(outcome, TaskOutcome::Completed { failures: 2 });
        assert_eq!(
            *log.lock(),
            vec!["panicky".to_string(), "post-1".to_string(), "post-2".to_string()]
        );
    }

    #[test]
    fn test_from_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::from_yaml(&format!(
            "data_root: {}\npipeline:\n  pre: [pull]\n  async: [pubsub]\n  post: []\n",
            dir.path().display()
        ))
        .unwrap();

        let pipeline = Pipeline::from_config(&config).unwrap();
        assert_eq!(pipeline.len(), 2);
        let names: Vec<&str> = pipeline.processors().map(|p| p.name()).collect();
        assert_eq!(names, vec!["pull", "pubsub"]);
    }
}
