//! cloud-a: S3-compatible storage backend implementation
//!
//! Uses object_store::aws::AmazonS3 with support for:
//! - Managed identity via the default AWS credential chain (IRSA,
//!   environment variables, EC2 instance metadata, ECS task role)
//! - Explicit credentials (access key ID and secret access key)
//! - Custom endpoints for S3-compatible services such as MinIO

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;
use std::sync::Arc;

use crate::config::AwsConfig;
use crate::errors::BackendError;
use crate::storage::object::PrefixedStore;
use crate::storage::{ObjectInfo, ProviderName, StorageBackend};

/// S3-compatible storage backend
pub struct AwsBackend {
    store: PrefixedStore,
    bucket: String,
    region: String,
    endpoint: Option<String>,
}

impl AwsBackend {
    /// Create a new S3 backend
    ///
    /// Nothing is contacted here; connectivity is only established by the
    /// first call, so an unreachable bucket does not block startup.
    pub fn new(config: &AwsConfig) -> anyhow::Result<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket_name)
            .with_region(&config.region);

        if !config.use_managed_identity {
            match (&config.access_key_id, &config.secret_access_key) {
                (Some(access_key_id), Some(secret_access_key)) => {
                    builder = builder
                        .with_access_key_id(access_key_id)
                        .with_secret_access_key(secret_access_key);
                }
                _ => anyhow::bail!(
                    "cloud-a credentials (access_key_id and secret_access_key) are required when use_managed_identity is false"
                ),
            }
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }

        if config.allow_http {
            builder = builder.with_allow_http(true);
        }

        let store: Arc<dyn ObjectStore> = Arc::new(builder.build()?);

        Ok(Self {
            store: PrefixedStore::new(store, config.prefix.clone()),
            bucket: config.bucket_name.clone(),
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_store(config: &AwsConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store: PrefixedStore::new(store, config.prefix.clone()),
            bucket: config.bucket_name.clone(),
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
        }
    }
}

#[async_trait]
impl StorageBackend for AwsBackend {
    fn name(&self) -> ProviderName {
        ProviderName::CloudA
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
        let key = self.store.full_key(path);
        match &self.endpoint {
            // path-style addressing for S3-compatible endpoints
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key),
            None => format!("https://{}.s3.{}.amazonaws.com/{}", self.bucket, self.region, key),
        }
    }
}
