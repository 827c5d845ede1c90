//! Replicate changed record files to object storage.

use super::record::is_record_file;
use super::{NotStarted, RepoSink};
use crate::io::write_file_list;
use crate::sync::{SyncConfig, SyncEngine};
use anyhow::{Context, Result};
use async_trait::async_trait;
use object_store::ObjectStore;
use std::path::PathBuf;
use std::sync::Arc;

pub struct S3Sink {
    data_root: PathBuf,
    store: Arc<dyn ObjectStore>,
    config: SyncConfig,
}

impl S3Sink {
    pub fn new(data_root: PathBuf, store: Arc<dyn ObjectStore>, config: SyncConfig) -> Self {
        Self {
            data_root,
            store,
            config,
        }
    }
}

#[async_trait]
impl RepoSink for S3Sink {
    fn name(&self) -> &str {
        "s3"
    }

    fn accept(&self, repo: &str, path: &str) -> bool {
        if !is_record_file(path) {
            return false;
        }

        // Deleted files still show up in change lists
        let absolute = self.data_root.join(repo).join(path);
        if !absolute.exists() {
            tracing::debug!("Not replicating {}, it doesn't exist", absolute.display());
            return false;
        }

        true
    }

    async fn process(&self, repo: &str, paths: &[String]) -> Result<()> {
        let root = self.data_root.join(repo);
        if !root.is_dir() {
            anyhow::bail!("Can't find repo {}", root.display());
        }

        let list = write_file_list(paths, &root).map_err(NotStarted::new)?;
        tracing::debug!("Process (s3) file list {}", list.path().display());

        // Fresh engine per run so counters and the retry budget cover this run only
        let engine = Arc::new(SyncEngine::new(Arc::clone(&self.store), self.config.clone()));
        engine
            .sync_file_list(list.path(), &root)
            .await
            .with_context(|| format!("Failed to process (s3) file list {}", list.path().display()))?;

        tracing::debug!("Successfully processed (s3) file list {}", list.path().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Processor, RepoProcessor};
    use crate::task::Task;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use object_store::GetOptions;
    use tempfile::TempDir;

    async fn exists(store: &Arc<dyn ObjectStore>, key: &str) -> bool {
        store
            .get_opts(&ObjectPath::from(key), GetOptions { head: true, ..Default::default() })
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn test_replicates_existing_record_files() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("whosonfirst-data");
        std::fs::create_dir_all(repo.join("data/101")).unwrap();
        std::fs::write(repo.join("data/101/101.geojson"), "{}").unwrap();
        std::fs::write(repo.join("data/101/101-alt-mapzen.geojson"), "{}").unwrap();
        std::fs::write(repo.join("README.md"), "readme").unwrap();

        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let processor = RepoProcessor::new(S3Sink::new(
            dir.path().to_path_buf(),
            Arc::clone(&store),
            SyncConfig {
                prefix: "mirror".to_string(),
                ..Default::default()
            },
        ));

        let task = Task::new(
            "c1",
            "whosonfirst-data",
            vec![
                "data/101/101.geojson".to_string(),
                "data/101/101-alt-mapzen.geojson".to_string(),
                "data/102/102.geojson".to_string(),
                "README.md".to_string(),
            ],
        );
        processor.process_task(&task).await.unwrap();

        assert!(exists(&store, "mirror/data/101/101.geojson").await);
        assert!(exists(&store, "mirror/data/101/101-alt-mapzen.geojson").await);
        assert!(!exists(&store, "mirror/README.md").await);
        assert!(!exists(&store, "mirror/data/102/102.geojson").await);
    }

    #[tokio::test]
    async fn test_missing_repo_fails() {
        let dir = TempDir::new().unwrap();
        let sink = S3Sink::new(dir.path().to_path_buf(), Arc::new(InMemory::new()), SyncConfig::default());

        assert!(sink.process("nope", &["1.geojson".to_string()]).await.is_err());
    }
}
