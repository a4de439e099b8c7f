//! Local filesystem storage backend implementation
//!
//! Uses object_store::local::LocalFileSystem rooted at the configured
//! directory. Writes go through a temporary file and a rename, so a failed
//! upload never leaves a partial object behind.

use async_trait::async_trait;
use bytes::Bytes;
use object_store::local::LocalFileSystem;
use object_store::ObjectStore;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::LocalConfig;
use crate::errors::BackendError;
use crate::storage::object::PrefixedStore;
use crate::storage::{ObjectInfo, ProviderName, StorageBackend};

/// Local disk storage backend
pub struct LocalBackend {
    store: PrefixedStore,
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new local backend, creating the root directory if needed
    pub async fn new(config: &LocalConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.root).await?;
        let root = tokio::fs::canonicalize(&config.root).await?;
        let store: Arc<dyn ObjectStore> = Arc::new(LocalFileSystem::new_with_prefix(&root)?);

        Ok(Self {
            store: PrefixedStore::new(store, config.prefix.clone()),
            root,
        })
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> ProviderName {
        ProviderName::Local
    }

    async fn get(&self, path: &str) -> Result<Bytes, BackendError> {
        self.store.get(path).await
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<(), BackendError> {
        self.store.put(path, data).await
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        self.store.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, BackendError> {
        self.store.list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<ObjectInfo, BackendError> {
        self.store.head(path).await
    }

    async fn check(&self) -> Result<(), BackendError> {
        let metadata = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| BackendError::Unreachable(format!("{}: {}", self.root.display(), e)))?;
        if !metadata.is_dir() {
            return Err(BackendError::Other(format!("{} is not a directory", self.root.display())));
        }
        if metadata.permissions().readonly() {
            return Err(BackendError::Unauthorized(format!("{} is read-only", self.root.display())));
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        let full_path = self.root.join(self.store.full_key(path));
        url::Url::from_file_path(&full_path)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| format!("file://{}", full_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ProviderLimits;

    async fn backend(dir: &tempfile::TempDir, prefix: Option<&str>) -> LocalBackend {
        LocalBackend::new(&LocalConfig {
            root: dir.path().join("files"),
            prefix: prefix.map(String::from),
            limits: ProviderLimits::default(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir, Some("uploads")).await;

        backend.put("receipts/r1.pdf", Bytes::from_static(b"%PDF-1.4")).await.unwrap();
        assert!(dir.path().join("files/uploads/receipts/r1.pdf").exists());
        assert_eq!(backend.get("receipts/r1.pdf").await.unwrap(), Bytes::from_static(b"%PDF-1.4"));

        let listed = backend.list("").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "receipts/r1.pdf");
        assert_eq!(listed[0].size, 8);

        backend.delete("receipts/r1.pdf").await.unwrap();
        assert!(backend.head("receipts/r1.pdf").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_check_and_url() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir, None).await;

        assert!(backend.check().await.is_ok());
        let url = backend.url("a/b.png");
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("/files/a/b.png"));
        assert_eq!(backend.name(), ProviderName::Local);
    }

    #[tokio::test]
    async fn test_check_fails_when_root_disappears() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir, None).await;
        std::fs::remove_dir_all(dir.path().join("files")).unwrap();

        let err = backend.check().await.unwrap_err();
        assert!(err.is_unreachable());
    }
}
