//! cloud-b: Google Cloud Storage backend implementation
//!
//! Uses object_store::gcp::GoogleCloudStorage with support for:
//! - Application Default Credentials (ADC) / Workload Identity
//! - Service account JSON key file
//! - Service account JSON key as string

use async_trait::async_trait;
use bytes::Bytes;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::ObjectStore;
use std::sync::Arc;

use crate::config::GcpConfig;
use crate::errors::BackendError;
use crate::storage::object::PrefixedStore;
use crate::storage::{ObjectInfo, ProviderName, StorageBackend};

const PUBLIC_ENDPOINT: &str = "https://storage.googleapis.com";

/// Google Cloud Storage backend
pub struct GcpBackend {
    store: PrefixedStore,
    bucket: String,
}

impl GcpBackend {
    /// Create a new GCS backend
    ///
    /// Explicit service account credentials win over ADC when configured.
    pub fn new(config: &GcpConfig) -> anyhow::Result<Self> {
        let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(&config.bucket_name);

        if let Some(service_account_path) = &config.service_account_path {
            builder = builder.with_service_account_path(service_account_path);
        } else if let Some(service_account_key) = &config.service_account_key {
            builder = builder.with_service_account_key(service_account_key);
        }

        let store: Arc<dyn ObjectStore> = Arc::new(builder.build()?);

        Ok(Self {
            store: PrefixedStore::new(store, config.prefix.clone()),
            bucket: config.bucket_name.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_store(config: &GcpConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store: PrefixedStore::new(store, config.prefix.clone()),
            bucket: config.bucket_name.clone(),
        }
    }
}

#[async_trait]
impl StorageBackend for GcpBackend {
    fn name(&self) -> ProviderName {
        ProviderName::CloudB
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
        self.store.list_root().await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", PUBLIC_ENDPOINT, self.bucket, self.store.full_key(path))
    }
}
