//! Shared object_store plumbing for the provider adapters

use bytes::Bytes;
use futures::stream::StreamExt;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore};
use std::sync::Arc;

use crate::errors::BackendError;
use crate::storage::ObjectInfo;

/// An object store plus the key prefix all paths are placed under
pub(crate) struct PrefixedStore {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl PrefixedStore {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, prefix: Option<String>) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self { store, prefix }
    }

    /// Apply prefix to path if configured
    pub(crate) fn apply_prefix(&self, path: &str) -> Path {
        let full_path = if let Some(prefix) = &self.prefix {
            format!("{}/{}", prefix, path)
        } else {
            path.to_string()
        };
        Path::from(full_path)
    }

    /// Full key as stored by the backend, used for URLs
    pub(crate) fn full_key(&self, path: &str) -> String {
        self.apply_prefix(path).to_string()
    }

    fn to_info(&self, meta: ObjectMeta) -> ObjectInfo {
        let location = meta.location.to_string();
        let path = match &self.prefix {
            Some(prefix) => location
                .strip_prefix(prefix.as_str())
                .map(|rest| rest.trim_start_matches('/').to_string())
                .unwrap_or(location),
            None => location,
        };
        ObjectInfo {
            path,
            size: meta.size as u64,
            last_modified: meta.last_modified,
        }
    }

    pub(crate) async fn get(&self, path: &str) -> Result<Bytes, BackendError> {
        let location = self.apply_prefix(path);
        let data = self.store.get(&location).await?;
        Ok(data.bytes().await?)
    }

    pub(crate) async fn put(&self, path: &str, data: Bytes) -> Result<(), BackendError> {
        let location = self.apply_prefix(path);
        self.store.put(&location, data.into()).await?;
        Ok(())
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<(), BackendError> {
        let location = self.apply_prefix(path);
        self.store.delete(&location).await?;
        Ok(())
    }

    pub(crate) async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, BackendError> {
        let listing_prefix = if prefix.is_empty() {
            self.prefix.as_ref().map(|p| Path::from(p.as_str()))
        } else {
            Some(self.apply_prefix(prefix))
        };

        let mut results = vec![];
        let mut stream = self.store.list(listing_prefix.as_ref());
        while let Some(meta) = stream.next().await {
            results.push(self.to_info(meta?));
        }
        results.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(results)
    }

    pub(crate) async fn head(&self, path: &str) -> Result<ObjectInfo, BackendError> {
        let location = self.apply_prefix(path);
        let meta = self.store.head(&location).await?;
        Ok(self.to_info(meta))
    }

    /// Cheapest call that exercises connectivity and credentials
    pub(crate) async fn list_root(&self) -> Result<(), BackendError> {
        let prefix = self.prefix.as_ref().map(|p| Path::from(p.as_str()));
        self.store.list_with_delimiter(prefix.as_ref()).await?;
        Ok(())
    }
}
