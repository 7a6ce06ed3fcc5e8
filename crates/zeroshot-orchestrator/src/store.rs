//! Persistence for [`ClusterRecord`]s: one JSON file per cluster under
//! `<storage_dir>/clusters/<cluster_id>.json`, written through the
//! temp-file-then-rename idiom so a crash mid-write never leaves a
//! truncated record behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use zeroshot_types::{ClusterRecord, ZeroshotError};

#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn save(&self, record: &ClusterRecord) -> Result<(), ZeroshotError>;
    async fn load(&self, cluster_id: &str) -> Result<Option<ClusterRecord>, ZeroshotError>;
    async fn delete(&self, cluster_id: &str) -> Result<(), ZeroshotError>;
    async fn list(&self) -> Result<Vec<String>, ZeroshotError>;
}

pub struct FileClusterStore {
    clusters_dir: PathBuf,
}

impl FileClusterStore {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            clusters_dir: storage_dir.into().join("clusters"),
        }
    }

    fn record_path(&self, cluster_id: &str) -> PathBuf {
        self.clusters_dir.join(format!("{cluster_id}.json"))
    }
}

#[async_trait]
impl ClusterStore for FileClusterStore {
    async fn save(&self, record: &ClusterRecord) -> Result<(), ZeroshotError> {
        tokio::fs::create_dir_all(&self.clusters_dir)
            .await
            .map_err(|err| ZeroshotError::Spawn(format!("mkdir {}: {err}", self.clusters_dir.display())))?;

        let path = self.record_path(&record.id);
        let body = serde_json::to_vec_pretty(record)
            .map_err(|err| ZeroshotError::Spawn(format!("serialize cluster record: {err}")))?;
        atomic_write(&path, &body).await
    }

    async fn load(&self, cluster_id: &str) -> Result<Option<ClusterRecord>, ZeroshotError> {
        let path = self.record_path(cluster_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .map_err(|err| ZeroshotError::Spawn(format!("parse cluster record {cluster_id}: {err}")))?;
                Ok(Some(record))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ZeroshotError::Spawn(format!("read {}: {err}", path.display()))),
        }
    }

    async fn delete(&self, cluster_id: &str) -> Result<(), ZeroshotError> {
        let path = self.record_path(cluster_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ZeroshotError::Spawn(format!("delete {}: {err}", path.display()))),
        }
    }

    async fn list(&self) -> Result<Vec<String>, ZeroshotError> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.clusters_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(err) => return Err(ZeroshotError::Spawn(format!("read {}: {err}", self.clusters_dir.display()))),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| ZeroshotError::Spawn(format!("readdir entry: {err}")))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

async fn atomic_write(path: &Path, content: &[u8]) -> Result<(), ZeroshotError> {
    let temp_path = path.with_extension("tmp");
    tokio::fs::write(&temp_path, content)
        .await
        .map_err(|err| ZeroshotError::Spawn(format!("write temp file: {err}")))?;
    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|err| ZeroshotError::Spawn(format!("rename temp file: {err}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroshot_types::ClusterConfig;

    fn sample_config() -> ClusterConfig {
        ClusterConfig {
            name: "demo".into(),
            agents: Vec::new(),
            max_model: None,
            isolation: false,
            worktree: false,
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().unwrap();
        let store = FileClusterStore::new(temp.path());
        let record = ClusterRecord::new("c1", 1_000, sample_config());

        store.save(&record).await.unwrap();
        let loaded = store.load("c1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "c1");
        assert_eq!(loaded.created_at_ms, 1_000);
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let temp = tempfile::tempdir().unwrap();
        let store = FileClusterStore::new(temp.path());
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let store = FileClusterStore::new(temp.path());
        let record = ClusterRecord::new("c1", 1_000, sample_config());
        store.save(&record).await.unwrap();

        store.delete("c1").await.unwrap();
        assert!(store.load("c1").await.unwrap().is_none());
        store.delete("c1").await.unwrap();
    }

    #[tokio::test]
    async fn list_returns_all_saved_ids() {
        let temp = tempfile::tempdir().unwrap();
        let store = FileClusterStore::new(temp.path());
        store.save(&ClusterRecord::new("a", 1, sample_config())).await.unwrap();
        store.save(&ClusterRecord::new("b", 2, sample_config())).await.unwrap();

        let mut ids = store.list().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
