//! Index record geometries into a Tile38 server over RESP.

use super::record::{is_alt_file, is_record_file, record_id};
use super::RepoSink;
use crate::config::Tile38Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub struct Tile38Sink {
    data_root: PathBuf,
    client: redis::Client,
    collection: String,
}

impl Tile38Sink {
    pub fn new(data_root: PathBuf, config: &Tile38Config) -> Result<Self> {
        let client = redis::Client::open(config.url())
            .with_context(|| format!("Invalid Tile38 address {}:{}", config.host, config.port))?;

        Ok(Self {
            data_root,
            client,
            collection: config.collection.clone(),
        })
    }
}

/// Id and serialized geometry of one GeoJSON record.
async fn index_entry(path: &Path) -> Result<(i64, String)> {
    let body = tokio::fs::read(path).await.with_context(|| format!("Failed to read {}", path.display()))?;
    let feature: serde_json::Value =
        serde_json::from_slice(&body).with_context(|| format!("Failed to parse {}", path.display()))?;

    let id = feature
        .pointer("/properties/wof:id")
        .and_then(|v| v.as_i64())
        .or_else(|| feature.get("id").and_then(|v| v.as_i64()))
        .or_else(|| path.to_str().and_then(record_id))
        .with_context(|| format!("{} has no id", path.display()))?;

    let geometry = feature
        .get("geometry")
        .filter(|g| g.is_object())
        .with_context(|| format!("{} has no geometry", path.display()))?;

    Ok((id, geometry.to_string()))
}

#[async_trait]
impl RepoSink for Tile38Sink {
    fn name(&self) -> &str {
        "tile38"
    }

    fn accept(&self, _repo: &str, path: &str) -> bool {
        is_record_file(path) && !is_alt_file(path)
    }

    async fn process(&self, repo: &str, paths: &[String]) -> Result<()> {
        let root = self.data_root.join(repo);
        if !root.is_dir() {
            anyhow::bail!("Can't find repo {}", root.display());
        }

        let mut con = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Tile38")?;

        let mut failed = 0;
        for path in paths {
            let absolute = root.join(path);
            let result = match index_entry(&absolute).await {
                Ok((id, geometry)) => {
                    let reply: redis::RedisResult<redis::Value> = redis::cmd("SET")
                        .arg(&self.collection)
                        .arg(id)
                        .arg("OBJECT")
                        .arg(geometry)
                        .query_async(&mut con)
                        .await;
                    reply.map(|_| ()).map_err(anyhow::Error::from)
                }
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                tracing::warn!("Failed to index {} in Tile38: {:#}", absolute.display(), e);
                failed += 1;
            }
        }

        if failed > 0 {
            anyhow::bail!("{} of {} files failed to index", failed, paths.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_index_entry() {
        let dir = TempDir::new().unwrap();

        let path = write(
            &dir,
            "85633041.geojson",
            r#"{"id": 1, "properties": {"wof:id": 85633041}, "geometry": {"type": "Point", "coordinates": [0, 0]}}"#,
        );
        let (id, geometry) = index_entry(&path).await.unwrap();
        assert_eq!(id, 85633041);
        assert!(geometry.contains("\"Point\""));

        let path = write(&dir, "123.geojson", r#"{"geometry": {"type": "Point", "coordinates": [1, 2]}}"#);
        assert_eq!(index_entry(&path).await.unwrap().0, 123);

        let path = write(&dir, "456.geojson", r#"{"properties": {}}"#);
        assert!(index_entry(&path).await.is_err());

        let path = write(&dir, "789.geojson", "not json");
        assert!(index_entry(&path).await.is_err());
    }

    #[test]
    fn test_accepts_primary_records_only() {
        let dir = TempDir::new().unwrap();
        let sink = Tile38Sink::new(dir.path().to_path_buf(), &Tile38Config::default()).unwrap();

        assert!(sink.accept("repo", "data/1.geojson"));
        assert!(!sink.accept("repo", "data/1-alt-mapzen.geojson"));
        assert!(!sink.accept("repo", "README.md"));
    }
}
