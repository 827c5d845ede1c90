//! Concurrent, hash-diffing replication of local files to an object store.
//!
//! A sync run has two passes. The first pass pushes every source through a
//! fixed pool of workers fed by a bounded channel; transfers that fail are
//! parked on a [`RetryStack`]. The retry pass re-runs each parked source
//! exactly once, unless the share of failures already exceeds the retry
//! budget, in which case the run gives up and reports degraded status.
//!
//! ```text
//! file list ──▶ dedupe ──▶ async_channel ──▶ N workers ──▶ object store
//!                                               │
//!                                          RetryStack ──▶ retry pass
//! ```

use super::metrics::SyncMetrics;
use super::retry::RetryStack;
use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, Attributes, GetOptions, GetResult, ObjectStore, PutOptions, PutPayload,
};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

/// User metadata key holding the hex MD5 of an uploaded object.
const MD5_METADATA_KEY: &str = "md5";

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Key prefix every object is written under
    pub prefix: String,

    /// Number of transfer workers
    pub concurrency: usize,

    /// Compare but never upload
    pub dry_run: bool,

    /// Failed transfers, as a percentage of scheduled ones, above which retries are abandoned
    pub max_retry_percent: f64,

    /// Attach the content hash as object metadata on upload.
    /// Off for stores that reject user metadata, such as the local filesystem.
    pub write_metadata: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            concurrency: 10,
            dry_run: false,
            max_retry_percent: 25.0,
            write_metadata: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to read file list {}: {source}", path.display())]
    FileList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("E_EXCESSIVE_ERRORS: {percent:.2}% of transfers failed, budget is {budget:.2}%")]
    ExcessiveErrors { percent: f64, budget: f64 },
}

/// What happened to one source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Uploaded, or would have been in dry-run mode
    Uploaded,
    /// Remote copy is current (or newer)
    Unchanged,
    /// Source no longer exists locally
    Missing,
}

struct Job {
    source: String,
    retry: bool,
}

/// Replicates local files into one object store.
///
/// Counters and the retry stack live for the lifetime of the engine, so
/// callers create one engine per sync run.
pub struct SyncEngine {
    store: Arc<dyn ObjectStore>,
    config: SyncConfig,
    metrics: Arc<SyncMetrics>,
    retries: RetryStack,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn ObjectStore>, config: SyncConfig) -> Self {
        Self {
            store,
            config,
            metrics: SyncMetrics::new(),
            retries: RetryStack::new(),
        }
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    /// One-line summary of the counters, safe to call at any time.
    pub fn status_report(&self) -> String {
        self.metrics.snapshot().to_string()
    }

    /// Sync every path listed, one per line, in `list`.
    ///
    /// The list is streamed, not loaded. Paths may be absolute or relative to `root`.
    pub async fn sync_file_list(self: &Arc<Self>, list: &Path, root: &Path) -> Result<(), SyncError> {
        let file = tokio::fs::File::open(list)
            .await
            .map_err(|source| SyncError::FileList {
                path: list.to_path_buf(),
                source,
            })?;
        let mut lines = BufReader::new(file).lines();

        let (tx, handles) = self.spawn_workers(root);
        let mut seen = HashSet::new();

        let read_result = loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !self.enqueue(&tx, &mut seen, &line, root).await {
                        break Ok(());
                    }
                }
                Ok(None) => break Ok(()),
                Err(source) => break Err(source),
            }
        };

        Self::drain(tx, handles).await;

        if let Err(source) = read_result {
            return Err(SyncError::FileList {
                path: list.to_path_buf(),
                source,
            });
        }

        self.finish_run(root).await
    }

    /// Sync an in-memory list of paths.
    pub async fn sync_files<S: AsRef<str>>(self: &Arc<Self>, paths: &[S], root: &Path) -> Result<(), SyncError> {
        let (tx, handles) = self.spawn_workers(root);
        let mut seen = HashSet::new();

        for path in paths {
            if !self.enqueue(&tx, &mut seen, path.as_ref(), root).await {
                break;
            }
        }

        Self::drain(tx, handles).await;
        self.finish_run(root).await
    }

    /// Sync every regular file below `root`.
    pub async fn sync_directory(self: &Arc<Self>, root: &Path) -> anyhow::Result<()> {
        let walk_root = root.to_path_buf();
        let paths = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<String>> {
            let mut paths = Vec::new();
            for entry in walkdir::WalkDir::new(&walk_root) {
                let entry = entry?;
                if entry.file_type().is_file() {
                    paths.push(entry.path().to_string_lossy().into_owned());
                }
            }
            Ok(paths)
        })
        .await??;

        tracing::info!("Found {} files under {}", paths.len(), root.display());
        self.sync_files(&paths, root).await?;
        Ok(())
    }

    /// Run the retry pass. Returns false if the retry budget was exceeded.
    pub async fn process_retries(self: &Arc<Self>, root: &Path) -> bool {
        if self.retries.is_empty() {
            return true;
        }

        let failed = self.retries.len() as u64;
        let scheduled = self.metrics.snapshot().scheduled;
        let percent = retry_percent(failed, scheduled);

        if percent > self.config.max_retry_percent {
            tracing::warn!(
                "E_EXCESSIVE_ERRORS: {} of {} transfers failed ({:.2}% > {:.2}%), not retrying",
                failed,
                scheduled,
                percent,
                self.config.max_retry_percent
            );
            self.retries.clear();
            return false;
        }

        tracing::info!("Retrying {} failed transfers", failed);

        let (tx, handles) = self.spawn_workers(root);
        while let Some(source) = self.retries.pop() {
            self.metrics.add_retried();
            self.metrics.add_scheduled();
            if tx.send(Job { source, retry: true }).await.is_err() {
                break;
            }
        }
        Self::drain(tx, handles).await;

        true
    }

    /// Replicate one file.
    pub async fn sync_file(&self, source: &str, root: &Path) -> anyhow::Result<SyncOutcome> {
        let local = resolve_source(source, root);
        let key = self.object_key(&local, root)?;

        let body = match tokio::fs::read(&local).await {
            Ok(body) => Bytes::from(body),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("{} does not exist, skipping", local.display());
                return Ok(SyncOutcome::Missing);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", local.display()));
            }
        };

        let local_hash = md5_hex(&body);

        if !self.has_changed(&local, &local_hash, &key).await? {
            tracing::debug!("{} has not changed, skipping", key);
            return Ok(SyncOutcome::Unchanged);
        }

        if self.config.dry_run {
            tracing::info!("[dry run] would upload {} to {}", local.display(), key);
            return Ok(SyncOutcome::Uploaded);
        }

        let mut options = PutOptions::default();
        if self.config.write_metadata {
            let mut attributes = Attributes::new();
            attributes.insert(Attribute::Metadata(MD5_METADATA_KEY.into()), local_hash.into());
            options.attributes = attributes;
        }

        self.store
            .put_opts(&key, PutPayload::from(body), options)
            .await
            .with_context(|| format!("Failed to upload {}", key))?;

        tracing::debug!("Uploaded {} to {}", local.display(), key);
        Ok(SyncOutcome::Uploaded)
    }

    /// Compare the local file against the remote object at `key`.
    async fn has_changed(&self, local: &Path, local_hash: &str, key: &ObjectPath) -> anyhow::Result<bool> {
        let head = match self
            .store
            .get_opts(key, GetOptions { head: true, ..Default::default() })
            .await
        {
            Ok(head) => head,
            Err(object_store::Error::NotFound { .. }) => return Ok(true),
            Err(e) => return Err(e).with_context(|| format!("Failed to look up {}", key)),
        };

        let remote_last_modified = head.meta.last_modified;
        let remote_hash = self.remote_hash(key, head).await?;

        if remote_hash == local_hash {
            return Ok(false);
        }

        let local_mtime: DateTime<Utc> = tokio::fs::metadata(local)
            .await
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to stat {}", local.display()))?
            .into();

        if remote_last_modified > local_mtime {
            tracing::warn!(
                "{} is newer remotely ({}) than locally ({}), not overwriting",
                key,
                remote_last_modified,
                local_mtime
            );
            return Ok(false);
        }

        Ok(true)
    }

    /// Content hash of the remote object: our metadata, then an MD5-shaped ETag,
    /// then the hash of the downloaded body.
    async fn remote_hash(&self, key: &ObjectPath, head: GetResult) -> anyhow::Result<String> {
        if let Some(value) = head.attributes.get(&Attribute::Metadata(MD5_METADATA_KEY.into())) {
            let value: &str = value.as_ref();
            return Ok(value.to_string());
        }

        if let Some(etag) = head.meta.e_tag.as_deref() {
            let etag = etag.trim_matches('"');
            if etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit()) {
                return Ok(etag.to_ascii_lowercase());
            }
        }

        let body = self
            .store
            .get_opts(key, GetOptions::default())
            .await
            .with_context(|| format!("Failed to fetch {}", key))?
            .bytes()
            .await
            .with_context(|| format!("Failed to read {}", key))?;

        Ok(md5_hex(&body))
    }

    /// Destination key: `local` relative to `root`, under the configured prefix.
    fn object_key(&self, local: &Path, root: &Path) -> anyhow::Result<ObjectPath> {
        let relative = local.strip_prefix(root).with_context(|| {
            format!("{} is not under {}", local.display(), root.display())
        })?;

        let mut parts: Vec<String> = Vec::new();
        let prefix = self.config.prefix.trim_matches('/');
        if !prefix.is_empty() {
            parts.push(prefix.to_string());
        }
        for component in relative.components() {
            if let Component::Normal(part) = component {
                parts.push(part.to_string_lossy().into_owned());
            }
        }

        if parts.is_empty() {
            anyhow::bail!("{} has no usable object key", local.display());
        }

        Ok(ObjectPath::from(parts.join("/")))
    }

    /// Queue `source` unless an equivalent path was already queued.
    /// Returns false once the workers are gone.
    async fn enqueue(
        &self,
        tx: &async_channel::Sender<Job>,
        seen: &mut HashSet<PathBuf>,
        source: &str,
        root: &Path,
    ) -> bool {
        let source = source.trim();
        if source.is_empty() {
            return true;
        }

        if !seen.insert(resolve_source(source, root)) {
            tracing::debug!("{} already scheduled", source);
            return true;
        }

        self.metrics.add_scheduled();
        tx.send(Job {
            source: source.to_string(),
            retry: false,
        })
        .await
        .is_ok()
    }

    fn spawn_workers(self: &Arc<Self>, root: &Path) -> (async_channel::Sender<Job>, Vec<JoinHandle<()>>) {
        let concurrency = self.config.concurrency.max(1);
        let (tx, rx) = async_channel::bounded::<Job>(concurrency * 2);

        let handles = (0..concurrency)
            .map(|_| {
                let engine = Arc::clone(self);
                let rx = rx.clone();
                let root = root.to_path_buf();

                tokio::spawn(async move {
                    while let Ok(job) = rx.recv().await {
                        engine.transfer(job, &root).await;
                    }
                })
            })
            .collect();

        (tx, handles)
    }

    async fn drain(tx: async_channel::Sender<Job>, handles: Vec<JoinHandle<()>>) {
        tx.close();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Sync worker panicked: {}", e);
            }
        }
    }

    async fn transfer(&self, job: Job, root: &Path) {
        let _active = self.metrics.worker_active();

        match self.sync_file(&job.source, root).await {
            Ok(SyncOutcome::Uploaded) => self.metrics.add_success(),
            Ok(SyncOutcome::Unchanged) => self.metrics.add_skipped(),
            Ok(SyncOutcome::Missing) => {}
            Err(e) => {
                self.metrics.add_error();
                if job.retry {
                    tracing::error!("Failed to sync {} on retry: {:#}", job.source, e);
                } else {
                    tracing::warn!("Failed to sync {}, will retry: {:#}", job.source, e);
                    self.retries.push(job.source);
                }
            }
        }

        self.metrics.add_completed();
    }

    async fn finish_run(self: &Arc<Self>, root: &Path) -> Result<(), SyncError> {
        let ok = self.process_retries(root).await;
        tracing::info!("{}", self.status_report());

        if ok {
            return Ok(());
        }

        let snapshot = self.metrics.snapshot();
        Err(SyncError::ExcessiveErrors {
            percent: retry_percent(snapshot.error, snapshot.scheduled),
            budget: self.config.max_retry_percent,
        })
    }
}

fn resolve_source(source: &str, root: &Path) -> PathBuf {
    let path = Path::new(source);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn retry_percent(failed: u64, scheduled: u64) -> f64 {
    if scheduled == 0 {
        return 100.0;
    }
    failed as f64 / scheduled as f64 * 100.0
}

fn md5_hex(body: &[u8]) -> String {
    hex::encode(Md5::digest(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::local::LocalFileSystem;
    use object_store::memory::InMemory;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, body: &str) -> PathBuf {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body).unwrap();
        path
    }

    fn engine(store: Arc<dyn ObjectStore>, config: SyncConfig) -> Arc<SyncEngine> {
        Arc::new(SyncEngine::new(store, config))
    }

    async fn put(store: &Arc<dyn ObjectStore>, key: &str, body: &str) {
        store
            .put_opts(
                &ObjectPath::from(key),
                PutPayload::from(Bytes::from(body.to_string())),
                PutOptions::default(),
            )
            .await
            .unwrap();
    }

    async fn fetch(store: &Arc<dyn ObjectStore>, key: &str) -> Option<Bytes> {
        match store.get_opts(&ObjectPath::from(key), GetOptions::default()).await {
            Ok(result) => Some(result.bytes().await.unwrap()),
            Err(object_store::Error::NotFound { .. }) => None,
            Err(e) => panic!("unexpected store error: {}", e),
        }
    }

    /// Remote filesystem store where every key under `blocked/` fails.
    fn blocked_store(remote: &TempDir) -> Arc<dyn ObjectStore> {
        std::fs::write(remote.path().join("blocked"), "not a directory").unwrap();
        Arc::new(LocalFileSystem::new_with_prefix(remote.path()).unwrap())
    }

    fn local_config() -> SyncConfig {
        SyncConfig {
            concurrency: 4,
            write_metadata: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_md5_hex() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_object_key() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let root = Path::new("/data/repo");

        let plain = SyncEngine::new(Arc::clone(&store), SyncConfig::default());
        let key = plain.object_key(Path::new("/data/repo/data/1.geojson"), root).unwrap();
        assert_eq!(key.as_ref(), "data/1.geojson");

        let prefixed = SyncEngine::new(
            store,
            SyncConfig {
                prefix: "/mirror/".to_string(),
                ..Default::default()
            },
        );
        let key = prefixed.object_key(Path::new("/data/repo/data/1.geojson"), root).unwrap();
        assert_eq!(key.as_ref(), "mirror/data/1.geojson");

        assert!(prefixed.object_key(Path::new("/elsewhere/1.geojson"), root).is_err());
    }

    #[tokio::test]
    async fn test_upload_then_skip_identical() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "data/1.geojson", "{\"id\":1}");
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

        let first = engine(Arc::clone(&store), SyncConfig::default());
        first.sync_files(&["data/1.geojson"], dir.path()).await.unwrap();
        assert_eq!(first.metrics().snapshot().success, 1);
        assert_eq!(fetch(&store, "data/1.geojson").await.unwrap(), Bytes::from("{\"id\":1}"));

        let second = engine(Arc::clone(&store), SyncConfig::default());
        second.sync_files(&["data/1.geojson"], dir.path()).await.unwrap();
        let snapshot = second.metrics().snapshot();
        assert_eq!(snapshot.skipped, 1);
        assert_eq!(snapshot.success, 0);
    }

    #[tokio::test]
    async fn test_identical_content_without_metadata() {
        let dir = TempDir::new().unwrap();
        let local = write(dir.path(), "a.json", "same");
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        put(&store, "a.json", "same").await;

        let engine = engine(Arc::clone(&store), local_config());
        let changed = engine
            .has_changed(&local, &md5_hex(b"same"), &ObjectPath::from("a.json"))
            .await
            .unwrap();
        assert!(!changed);

        engine.sync_files(&["a.json"], dir.path()).await.unwrap();
        assert_eq!(engine.metrics().snapshot().skipped, 1);
    }

    #[tokio::test]
    async fn test_changed_content_is_uploaded() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        put(&store, "a.json", "old").await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let local = write(dir.path(), "a.json", "new");

        let engine = engine(Arc::clone(&store), SyncConfig::default());
        let changed = engine
            .has_changed(&local, &md5_hex(b"new"), &ObjectPath::from("a.json"))
            .await
            .unwrap();
        assert!(changed);

        engine.sync_files(&["a.json"], dir.path()).await.unwrap();
        assert_eq!(engine.metrics().snapshot().success, 1);
        assert_eq!(fetch(&store, "a.json").await.unwrap(), Bytes::from("new"));
    }

    #[tokio::test]
    async fn test_newer_remote_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.json", "local");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        put(&store, "a.json", "remote").await;

        let engine = engine(Arc::clone(&store), SyncConfig::default());
        engine.sync_files(&["a.json"], dir.path()).await.unwrap();

        assert_eq!(engine.metrics().snapshot().skipped, 1);
        assert_eq!(fetch(&store, "a.json").await.unwrap(), Bytes::from("remote"));
    }

    #[tokio::test]
    async fn test_file_list_duplicates_scheduled_once() {
        let dir = TempDir::new().unwrap();
        let absolute = write(dir.path(), "data/1.geojson", "{}");
        let list = dir.path().join("files.txt");
        std::fs::write(
            &list,
            format!("data/1.geojson\n\ndata/1.geojson\n{}\n", absolute.display()),
        )
        .unwrap();

        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let engine = engine(store, SyncConfig::default());
        engine.sync_file_list(&list, dir.path()).await.unwrap();

        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.scheduled, 1);
        assert_eq!(snapshot.success, 1);
    }

    #[tokio::test]
    async fn test_missing_source_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let engine = engine(store, SyncConfig::default());

        engine.sync_files(&["gone.json"], dir.path()).await.unwrap();

        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.success, 0);
        assert_eq!(snapshot.error, 0);
    }

    #[tokio::test]
    async fn test_missing_file_list() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let engine = engine(store, SyncConfig::default());

        let result = engine.sync_file_list(&dir.path().join("nope.txt"), dir.path()).await;
        assert!(matches!(result, Err(SyncError::FileList { .. })));
    }

    #[tokio::test]
    async fn test_dry_run_does_not_upload() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.json", "body");
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

        let engine = engine(
            Arc::clone(&store),
            SyncConfig {
                dry_run: true,
                ..Default::default()
            },
        );
        engine.sync_files(&["a.json"], dir.path()).await.unwrap();

        assert_eq!(engine.metrics().snapshot().success, 1);
        assert!(fetch(&store, "a.json").await.is_none());
    }

    #[tokio::test]
    async fn test_retry_budget_exceeded() {
        let dir = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        write(dir.path(), "blocked/a.json", "a");
        write(dir.path(), "blocked/b.json", "b");
        write(dir.path(), "ok.json", "ok");

        let engine = engine(blocked_store(&remote), local_config());
        let result = engine
            .sync_files(&["blocked/a.json", "blocked/b.json", "ok.json"], dir.path())
            .await;

        assert!(matches!(result, Err(SyncError::ExcessiveErrors { .. })));
        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.scheduled, 3);
        assert_eq!(snapshot.error, 2);
        assert_eq!(snapshot.success, 1);
        assert_eq!(snapshot.retried, 0);
    }

    #[tokio::test]
    async fn test_retry_within_budget() {
        let dir = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let mut paths = vec!["blocked/a.json".to_string()];
        write(dir.path(), "blocked/a.json", "a");
        for i in 0..4 {
            let path = format!("ok/{}.json", i);
            write(dir.path(), &path, "ok");
            paths.push(path);
        }

        let engine = engine(blocked_store(&remote), local_config());
        engine.sync_files(&paths, dir.path()).await.unwrap();

        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.scheduled, 6);
        assert_eq!(snapshot.success, 4);
        // The retry fails too and is not retried again
        assert_eq!(snapshot.error, 2);
        assert_eq!(snapshot.completed, 6);
        assert!(remote.path().join("ok/3.json").exists());
    }

    #[tokio::test]
    async fn test_sync_directory() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "data/1.geojson", "1");
        write(dir.path(), "data/nested/2.geojson", "2");
        write(dir.path(), "README.md", "readme");

        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let engine = engine(Arc::clone(&store), SyncConfig::default());
        engine.sync_directory(dir.path()).await.unwrap();

        assert_eq!(engine.metrics().snapshot().success, 3);
        assert!(fetch(&store, "data/nested/2.geojson").await.is_some());
        assert!(engine.status_report().contains("Success: 3"));
    }
}
