//! File catalog
//!
//! Maps each logical path to its canonical provider. Shadow copies written
//! by a multi-provider sync are not recorded; a record always points at
//! exactly one provider.
//!
//! The catalog lives in memory and, when a snapshot path is configured, is
//! persisted as a JSON document after every change. The snapshot is written
//! to a temporary file and renamed into place so a crash never leaves a
//! truncated catalog behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::{Classify, ErrorKind};
use crate::storage::ProviderName;

/// Catalog record of one stored file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub path: String,
    pub provider: ProviderName,
    pub size_bytes: u64,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog snapshot is invalid: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classify for CatalogError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

#[derive(Serialize, Deserialize, Default)]
struct Snapshot {
    files: Vec<StoredFile>,
}

/// Path-to-provider catalog
pub struct FileCatalog {
    files: RwLock<BTreeMap<String, StoredFile>>,
    snapshot: Option<PathBuf>,
}

impl FileCatalog {
    /// Catalog without persistence
    pub fn in_memory() -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
            snapshot: None,
        }
    }

    /// Open a catalog persisted at `path`, starting empty when it does not exist
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(content) => serde_json::from_slice::<Snapshot>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };

        let files: BTreeMap<String, StoredFile> = snapshot
            .files
            .into_iter()
            .map(|file| (file.path.clone(), file))
            .collect();
        info!(path = %path.display(), records = files.len(), "File catalog loaded");

        Ok(Self {
            files: RwLock::new(files),
            snapshot: Some(path),
        })
    }

    /// True when records survive a restart
    pub fn is_durable(&self) -> bool {
        self.snapshot.is_some()
    }

    pub async fn get(&self, path: &str) -> Option<StoredFile> {
        self.files.read().await.get(path).cloned()
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.files.read().await.contains_key(path)
    }

    /// Insert or replace the record for `file.path`
    pub async fn upsert(&self, file: StoredFile) -> Result<(), CatalogError> {
        let mut files = self.files.write().await;
        debug!(path = %file.path, provider = %file.provider, "Catalog upsert");
        let mut next = files.clone();
        next.insert(file.path.clone(), file);
        self.persist(&next).await?;
        *files = next;
        Ok(())
    }

    /// Remove a record, returning it when it existed
    pub async fn remove(&self, path: &str) -> Result<Option<StoredFile>, CatalogError> {
        let mut files = self.files.write().await;
        if !files.contains_key(path) {
            return Ok(None);
        }
        let mut next = files.clone();
        let removed = next.remove(path);
        self.persist(&next).await?;
        *files = next;
        Ok(removed)
    }

    /// Point the record for `path` at `to`, only if it still points at `from`
    pub async fn repoint(&self, path: &str, from: ProviderName, to: ProviderName) -> Result<bool, CatalogError> {
        let mut files = self.files.write().await;
        if !matches!(files.get(path), Some(file) if file.provider == from) {
            return Ok(false);
        }
        let mut next = files.clone();
        if let Some(file) = next.get_mut(path) {
            file.provider = to;
        }
        self.persist(&next).await?;
        *files = next;
        debug!(path = %path, from = %from, to = %to, "Catalog record re-pointed");
        Ok(true)
    }

    /// All records in path order
    pub async fn list(&self) -> Vec<StoredFile> {
        self.files.read().await.values().cloned().collect()
    }

    pub async fn count_by_provider(&self) -> BTreeMap<ProviderName, usize> {
        let mut counts = BTreeMap::new();
        for file in self.files.read().await.values() {
            *counts.entry(file.provider).or_insert(0) += 1;
        }
        counts
    }

    async fn persist(&self, files: &BTreeMap<String, StoredFile>) -> Result<(), CatalogError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };

        let snapshot = Snapshot {
            files: files.values().cloned().collect(),
        };
        let content = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = temp_path(path);
        tokio::fs::write(&temp, content).await?;
        if let Err(e) = tokio::fs::rename(&temp, path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, provider: ProviderName) -> StoredFile {
        StoredFile {
            path: path.to_string(),
            provider,
            size_bytes: 42,
            mime_type: "text/plain".to_string(),
            uploaded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_repoint() {
        let catalog = FileCatalog::in_memory();
        catalog.upsert(record("a.txt", ProviderName::Local)).await.unwrap();
        catalog.upsert(record("b.txt", ProviderName::CloudA)).await.unwrap();

        assert!(catalog.repoint("a.txt", ProviderName::Local, ProviderName::CloudB).await.unwrap());
        // stale source: record already moved
        assert!(!catalog.repoint("a.txt", ProviderName::Local, ProviderName::CloudA).await.unwrap());
        assert!(!catalog.repoint("missing.txt", ProviderName::Local, ProviderName::CloudA).await.unwrap());

        assert_eq!(catalog.get("a.txt").await.unwrap().provider, ProviderName::CloudB);
        assert_eq!(catalog.count_by_provider().await.get(&ProviderName::CloudB), Some(&1));
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("catalog.json");

        let catalog = FileCatalog::open(&path).await.unwrap();
        assert!(catalog.is_durable());
        catalog.upsert(record("reports/q1.pdf", ProviderName::CloudB)).await.unwrap();
        catalog.upsert(record("notes.txt", ProviderName::Local)).await.unwrap();
        catalog.remove("notes.txt").await.unwrap();

        let reopened = FileCatalog::open(&path).await.unwrap();
        let files = reopened.list().await;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "reports/q1.pdf");
        assert_eq!(files[0].provider, ProviderName::CloudB);
        assert!(!dir.path().join("state").join("catalog.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_records_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let catalog = FileCatalog::open(&path).await.unwrap();
        catalog.upsert(record("kept.txt", ProviderName::Local)).await.unwrap();

        // a non-empty directory in place of the snapshot makes the rename fail
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("blocker"), b"x").unwrap();

        assert!(catalog.upsert(record("new.txt", ProviderName::CloudA)).await.is_err());
        assert!(!catalog.contains("new.txt").await);

        assert!(catalog.remove("kept.txt").await.is_err());
        assert!(catalog.contains("kept.txt").await);

        assert!(catalog
            .repoint("kept.txt", ProviderName::Local, ProviderName::CloudB)
            .await
            .is_err());
        assert_eq!(catalog.get("kept.txt").await.unwrap().provider, ProviderName::Local);
        assert!(!dir.path().join("catalog.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = FileCatalog::open(&path).await.err().unwrap();
        assert!(matches!(err, CatalogError::Serialization(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_record_serialization() {
        let json = serde_json::to_value(record("a.txt", ProviderName::CloudA)).unwrap();
        assert_eq!(json["provider"], "cloud-a");
        assert_eq!(json["sizeBytes"], 42);
        assert_eq!(json["mimeType"], "text/plain");
    }
}
