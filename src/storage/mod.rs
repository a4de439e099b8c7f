//! Storage provider abstraction layer
//!
//! Provides a unified interface over the three file-storage providers
//! (local disk, cloud-a on S3-compatible storage, cloud-b on Google Cloud
//! Storage) using the object_store crate. Every adapter translates raw
//! `object_store` failures into [`BackendError`] before returning.

mod aws;
mod gcp;
mod limits;
mod local;
pub(crate) mod object;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::config::StorageConfig;
use crate::errors::BackendError;

pub use aws::AwsBackend;
pub use gcp::GcpBackend;
pub use limits::{LimitViolation, ProviderLimits};
pub use local::LocalBackend;

/// The closed set of file-storage providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProviderName {
    /// Local filesystem
    #[serde(rename = "local")]
    Local,
    /// S3-compatible object storage
    #[serde(rename = "cloud-a")]
    CloudA,
    /// Google Cloud Storage
    #[serde(rename = "cloud-b")]
    CloudB,
}

impl ProviderName {
    pub const ALL: [ProviderName; 3] = [ProviderName::Local, ProviderName::CloudA, ProviderName::CloudB];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Local => "local",
            ProviderName::CloudA => "cloud-a",
            ProviderName::CloudB => "cloud-b",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" | "fs" | "filesystem" => Ok(ProviderName::Local),
            "cloud-a" | "cloud_a" | "s3" | "aws" => Ok(ProviderName::CloudA),
            "cloud-b" | "cloud_b" | "gcs" | "gcp" => Ok(ProviderName::CloudB),
            _ => Err(format!("Unknown storage provider: {}", s)),
        }
    }
}

/// Metadata of one stored object, with a provider-relative path
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub path: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Storage backend trait for unified object storage operations
///
/// Paths are logical keys relative to the provider's configured prefix.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Which provider this adapter talks to
    fn name(&self) -> ProviderName;

    /// Get an object by path
    async fn get(&self, path: &str) -> Result<Bytes, BackendError>;

    /// Put an object at the given path, replacing any previous content
    async fn put(&self, path: &str, data: Bytes) -> Result<(), BackendError>;

    /// Delete an object at the given path
    async fn delete(&self, path: &str) -> Result<(), BackendError>;

    /// List objects with the given prefix
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, BackendError>;

    /// Get object metadata (HEAD operation)
    async fn head(&self, path: &str) -> Result<ObjectInfo, BackendError>;

    /// Lightweight reachability and credential check
    async fn check(&self) -> Result<(), BackendError>;

    /// Address under which the object can be fetched
    fn url(&self, path: &str) -> String;
}

struct ProviderEntry {
    backend: Arc<dyn StorageBackend>,
    limits: ProviderLimits,
}

/// The configured providers with their upload limits
#[derive(Default)]
pub struct ProviderRegistry {
    entries: BTreeMap<ProviderName, ProviderEntry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any previous adapter of the same name
    pub fn register(&mut self, backend: Arc<dyn StorageBackend>, limits: ProviderLimits) {
        self.entries.insert(backend.name(), ProviderEntry { backend, limits });
    }

    pub fn with(mut self, backend: Arc<dyn StorageBackend>, limits: ProviderLimits) -> Self {
        self.register(backend, limits);
        self
    }

    pub fn backend(&self, name: ProviderName) -> Option<Arc<dyn StorageBackend>> {
        self.entries.get(&name).map(|entry| entry.backend.clone())
    }

    pub fn limits(&self, name: ProviderName) -> Option<&ProviderLimits> {
        self.entries.get(&name).map(|entry| &entry.limits)
    }

    pub fn contains(&self, name: ProviderName) -> bool {
        self.entries.contains_key(&name)
    }

    pub fn backends(&self) -> Vec<Arc<dyn StorageBackend>> {
        self.entries.values().map(|entry| entry.backend.clone()).collect()
    }
}

/// Create the provider registry from configuration
///
/// Only providers with a configuration block are registered; the others are
/// reported as "not configured" by the health monitor.
pub async fn create_registry(config: &StorageConfig) -> anyhow::Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    if let Some(local) = &config.local {
        let backend = LocalBackend::new(local).await?;
        registry.register(Arc::new(backend), local.limits.clone());
        info!(provider = %ProviderName::Local, root = %local.root.display(), "Storage provider configured");
    }

    if let Some(aws) = &config.cloud_a {
        let backend = AwsBackend::new(aws)?;
        registry.register(Arc::new(backend), aws.limits.clone());
        info!(provider = %ProviderName::CloudA, bucket = %aws.bucket_name, "Storage provider configured");
    }

    if let Some(gcp) = &config.cloud_b {
        let backend = GcpBackend::new(gcp)?;
        registry.register(Arc::new(backend), gcp.limits.clone());
        info!(provider = %ProviderName::CloudB, bucket = %gcp.bucket_name, "Storage provider configured");
    }

    Ok(registry)
}

/// Check that a logical path is usable as an object key
pub fn validate_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("path must not be empty".to_string());
    }
    if path.starts_with('/') || path.ends_with('/') {
        return Err(format!("path must be relative and name a file: {}", path));
    }
    if path.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(format!("path contains an invalid segment: {}", path));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_name_parsing() {
        assert_eq!(ProviderName::from_str("local").unwrap(), ProviderName::Local);
        assert_eq!(ProviderName::from_str("cloud-a").unwrap(), ProviderName::CloudA);
        assert_eq!(ProviderName::from_str("GCS").unwrap(), ProviderName::CloudB);
        assert!(ProviderName::from_str("dropbox").is_err());
    }

    #[test]
    fn test_provider_name_serde() {
        let json = serde_json::to_string(&ProviderName::CloudB).unwrap();
        assert_eq!(json, "\"cloud-b\"");
        let parsed: ProviderName = serde_json::from_str("\"cloud-a\"").unwrap();
        assert_eq!(parsed, ProviderName::CloudA);
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("invoices/2024/march.pdf").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("a/../b").is_err());
        assert!(validate_path("a//b").is_err());
        assert!(validate_path("folder/").is_err());
    }
}
