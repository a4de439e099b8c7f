//! Storage Coordinator
//!
//! Routes file operations to the configured providers. Holds the preferred
//! provider, records each file's canonical provider in the catalog and owns
//! the migration tracker. Every provider call is a single bounded attempt;
//! nothing is retried behind the caller's back.

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::catalog::{CatalogError, FileCatalog, StoredFile};
use crate::errors::{with_timeout, BackendError, Classify, ErrorKind};
use crate::health::{HealthMonitor, ProbeTarget};
use crate::metrics::record_storage_operation;
use crate::migration::{CleanupPolicy, MigrationTracker};
use crate::storage::{validate_path, LimitViolation, ProviderName, ProviderRegistry, StorageBackend};

/// Snapshot of provider availability
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub preferred: ProviderName,
    /// Configured providers whose probe succeeded
    pub available: Vec<ProviderName>,
    /// Every provider, configured or not
    pub health_check: BTreeMap<ProviderName, bool>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<ProviderName, String>,
    /// Catalog records per canonical provider
    pub files: BTreeMap<ProviderName, usize>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreferenceError {
    #[error("provider {provider} is not configured")]
    NotConfigured { provider: ProviderName },

    #[error("provider {provider} is unhealthy: {detail}")]
    Unhealthy { provider: ProviderName, detail: String },
}

impl Classify for PreferenceError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::PreconditionFailed
    }

    fn backend(&self) -> Option<String> {
        match self {
            PreferenceError::NotConfigured { provider } | PreferenceError::Unhealthy { provider, .. } => {
                Some(provider.to_string())
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("provider {provider} is unavailable: {detail}")]
    ProviderUnavailable { provider: ProviderName, detail: String },

    #[error("rejected by {provider}: file is {size} bytes, limit is {limit} bytes")]
    SizeExceeded {
        provider: ProviderName,
        size: u64,
        limit: u64,
    },

    #[error("rejected by {provider}: MIME type {mime} is not accepted")]
    TypeRejected { provider: ProviderName, mime: String },

    #[error("write to {provider} failed: {source}")]
    Backend {
        provider: ProviderName,
        source: BackendError,
    },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl StoreError {
    fn rejected(provider: ProviderName, violation: LimitViolation) -> Self {
        match violation {
            LimitViolation::SizeExceeded { size, limit } => StoreError::SizeExceeded { provider, size, limit },
            LimitViolation::TypeRejected { mime } => StoreError::TypeRejected { provider, mime },
        }
    }
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidPath(_) => ErrorKind::InvalidRequest,
            StoreError::ProviderUnavailable { .. } => ErrorKind::Unhealthy,
            StoreError::SizeExceeded { .. } | StoreError::TypeRejected { .. } => ErrorKind::SizeOrTypeRejected,
            StoreError::Backend { source, .. } => source.kind(),
            StoreError::Catalog(e) => e.kind(),
        }
    }

    fn backend(&self) -> Option<String> {
        match self {
            StoreError::ProviderUnavailable { provider, .. }
            | StoreError::SizeExceeded { provider, .. }
            | StoreError::TypeRejected { provider, .. }
            | StoreError::Backend { provider, .. } => Some(provider.to_string()),
            StoreError::InvalidPath(_) | StoreError::Catalog(_) => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncFileError {
    #[error("no target providers given")]
    NoTargets,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl Classify for SyncFileError {
    fn kind(&self) -> ErrorKind {
        match self {
            SyncFileError::NoTargets | SyncFileError::InvalidPath(_) => ErrorKind::InvalidRequest,
            SyncFileError::Catalog(e) => e.kind(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("file not found: {path}")]
    NotFound { path: String },

    #[error("{provider} could not serve {path}: {source}")]
    Unavailable {
        provider: ProviderName,
        path: String,
        source: BackendError,
    },
}

impl Classify for ReadError {
    fn kind(&self) -> ErrorKind {
        match self {
            ReadError::InvalidPath(_) => ErrorKind::InvalidRequest,
            ReadError::NotFound { .. } => ErrorKind::NotFound,
            ReadError::Unavailable { source, .. } => match source.kind() {
                ErrorKind::NotFound => ErrorKind::Unreachable,
                kind => kind,
            },
        }
    }

    fn backend(&self) -> Option<String> {
        match self {
            ReadError::Unavailable { provider, .. } => Some(provider.to_string()),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum DeleteError {
    #[error("file not found: {path}")]
    NotFound { path: String },

    #[error("delete on {provider} failed: {source}")]
    Backend {
        provider: ProviderName,
        source: BackendError,
    },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl Classify for DeleteError {
    fn kind(&self) -> ErrorKind {
        match self {
            DeleteError::NotFound { .. } => ErrorKind::NotFound,
            DeleteError::Backend { source, .. } => source.kind(),
            DeleteError::Catalog(e) => e.kind(),
        }
    }

    fn backend(&self) -> Option<String> {
        match self {
            DeleteError::Backend { provider, .. } => Some(provider.to_string()),
            _ => None,
        }
    }
}

/// Aggregate result of a multi-provider write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Succeeded,
    PartialFailure,
    Failed,
}

/// Result of writing to one target
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOutcome {
    pub provider: ProviderName,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub path: String,
    pub status: SyncStatus,
    pub targets: Vec<TargetOutcome>,
    /// Canonical provider recorded after the sync, if any
    pub canonical: Option<ProviderName>,
}

impl SyncOutcome {
    pub fn succeeded(&self) -> Vec<ProviderName> {
        self.targets.iter().filter(|t| t.success).map(|t| t.provider).collect()
    }

    pub fn failed(&self) -> Vec<ProviderName> {
        self.targets.iter().filter(|t| !t.success).map(|t| t.provider).collect()
    }
}

/// Content of a file together with where it was served from
#[derive(Debug, Clone)]
pub struct FileContent {
    pub file: StoredFile,
    pub served_by: ProviderName,
    pub data: Bytes,
}

/// Storage coordinator
pub struct StorageCoordinator {
    registry: Arc<ProviderRegistry>,
    monitor: Arc<HealthMonitor>,
    catalog: Arc<FileCatalog>,
    timeout: Duration,
    preferred: RwLock<ProviderName>,
    /// Serializes preference changes; held across the verification probe
    preference_lock: Mutex<()>,
    migrations: MigrationTracker,
}

impl StorageCoordinator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        monitor: Arc<HealthMonitor>,
        catalog: Arc<FileCatalog>,
        preferred: ProviderName,
        timeout: Duration,
    ) -> Self {
        let migrations = MigrationTracker::new(registry.clone(), monitor.clone(), catalog.clone(), timeout);
        Self {
            registry,
            monitor,
            catalog,
            timeout,
            preferred: RwLock::new(preferred),
            preference_lock: Mutex::new(()),
            migrations,
        }
    }

    /// Replace the orphan policy used by cleanup
    pub fn with_cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.migrations = self.migrations.with_cleanup_policy(policy);
        self
    }

    pub fn migrations(&self) -> &MigrationTracker {
        &self.migrations
    }

    pub fn catalog(&self) -> &FileCatalog {
        &self.catalog
    }

    pub async fn preferred(&self) -> ProviderName {
        *self.preferred.read().await
    }

    /// Probe every provider and report which ones are available
    pub async fn status(&self) -> StorageStatus {
        let targets: Vec<ProbeTarget> = ProviderName::ALL.iter().map(|p| ProbeTarget::Provider(*p)).collect();
        let results = self.monitor.probe_many(&targets).await;

        let mut available = Vec::new();
        let mut health_check = BTreeMap::new();
        let mut details = BTreeMap::new();
        for (name, result) in ProviderName::ALL.iter().zip(results.into_iter().map(|(_, r)| r)) {
            health_check.insert(*name, result.healthy);
            if result.healthy {
                available.push(*name);
            } else if let Some(detail) = result.detail {
                details.insert(*name, detail);
            }
        }

        StorageStatus {
            preferred: self.preferred().await,
            available,
            health_check,
            details,
            files: self.catalog.count_by_provider().await,
        }
    }

    /// Make `provider` the default upload target
    ///
    /// The provider is probed uncached immediately before the change; an
    /// unhealthy provider is refused and the preference stays as it was.
    pub async fn set_preferred(&self, provider: ProviderName) -> Result<(), PreferenceError> {
        if !self.registry.contains(provider) {
            return Err(PreferenceError::NotConfigured { provider });
        }

        let _guard = self.preference_lock.lock().await;
        let probe = self.monitor.probe_fresh(ProbeTarget::Provider(provider)).await;
        if !probe.healthy {
            let detail = probe.detail.unwrap_or_else(|| "unhealthy".to_string());
            warn!(provider = %provider, detail = %detail, "Refusing unhealthy preferred provider");
            return Err(PreferenceError::Unhealthy { provider, detail });
        }

        let previous = std::mem::replace(&mut *self.preferred.write().await, provider);
        if previous != provider {
            info!(from = %previous, to = %provider, "Preferred storage provider changed");
        }
        Ok(())
    }

    fn configured(&self, provider: ProviderName) -> Result<Arc<dyn StorageBackend>, BackendError> {
        self.registry.backend(provider).ok_or(BackendError::NotConfigured)
    }

    /// Store a file on `provider`, or on the preferred provider when `None`
    ///
    /// Limits are checked before anything is written, so a rejected file
    /// never leaves a partial object behind.
    pub async fn store(
        &self,
        path: &str,
        data: Bytes,
        mime_type: Option<&str>,
        provider: Option<ProviderName>,
    ) -> Result<StoredFile, StoreError> {
        validate_path(path).map_err(StoreError::InvalidPath)?;
        let provider = match provider {
            Some(provider) => provider,
            None => self.preferred().await,
        };
        let mime_type = resolve_mime(path, mime_type);
        let size = data.len() as u64;

        let backend = self.configured(provider).map_err(|e| StoreError::ProviderUnavailable {
            provider,
            detail: e.to_string(),
        })?;
        if let Some(limits) = self.registry.limits(provider) {
            limits
                .validate(size, &mime_type)
                .map_err(|violation| StoreError::rejected(provider, violation))?;
        }

        let probe = self.monitor.probe(ProbeTarget::Provider(provider)).await;
        if !probe.healthy {
            return Err(StoreError::ProviderUnavailable {
                provider,
                detail: probe.detail.unwrap_or_else(|| "unhealthy".to_string()),
            });
        }

        let result = with_timeout(self.timeout, backend.put(path, data)).await;
        record_storage_operation(provider.as_str(), "put", result.is_ok());
        result.map_err(|source| StoreError::Backend { provider, source })?;

        let file = StoredFile {
            path: path.to_string(),
            provider,
            size_bytes: size,
            mime_type,
            uploaded_at: Utc::now(),
        };
        self.catalog.upsert(file.clone()).await?;
        info!(path = %path, provider = %provider, size, "File stored");
        Ok(file)
    }

    async fn write_target(
        &self,
        provider: ProviderName,
        path: &str,
        data: Bytes,
        mime_type: &str,
    ) -> TargetOutcome {
        let outcome = async {
            let backend = self.configured(provider).map_err(|e| (e.kind(), e.to_string()))?;
            if let Some(limits) = self.registry.limits(provider) {
                limits
                    .validate(data.len() as u64, mime_type)
                    .map_err(|v| (ErrorKind::SizeOrTypeRejected, v.to_string()))?;
            }
            let result = with_timeout(self.timeout, backend.put(path, data)).await;
            record_storage_operation(provider.as_str(), "put", result.is_ok());
            result.map_err(|e| (e.kind(), e.to_string()))
        }
        .await;

        match outcome {
            Ok(()) => TargetOutcome {
                provider,
                success: true,
                kind: None,
                error: None,
            },
            Err((kind, error)) => {
                warn!(path = %path, provider = %provider, error = %error, "Sync target failed");
                TargetOutcome {
                    provider,
                    success: false,
                    kind: Some(kind),
                    error: Some(error),
                }
            }
        }
    }

    /// Write `data` to every target provider independently
    ///
    /// All targets are attempted even when some fail. When the path has no
    /// catalog record yet, the first successful target (the preferred
    /// provider if it succeeded) becomes canonical; the rest are shadow
    /// copies.
    pub async fn sync_file_across_providers(
        &self,
        path: &str,
        data: Bytes,
        mime_type: Option<&str>,
        targets: &[ProviderName],
    ) -> Result<SyncOutcome, SyncFileError> {
        if targets.is_empty() {
            return Err(SyncFileError::NoTargets);
        }
        validate_path(path).map_err(SyncFileError::InvalidPath)?;

        let targets: Vec<ProviderName> = targets.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        let mime_type = resolve_mime(path, mime_type);
        let size = data.len() as u64;

        let outcomes = join_all(
            targets
                .iter()
                .map(|provider| self.write_target(*provider, path, data.clone(), &mime_type)),
        )
        .await;

        let succeeded: Vec<ProviderName> = outcomes.iter().filter(|o| o.success).map(|o| o.provider).collect();
        let status = if succeeded.len() == outcomes.len() {
            SyncStatus::Succeeded
        } else if succeeded.is_empty() {
            SyncStatus::Failed
        } else {
            SyncStatus::PartialFailure
        };

        let canonical = match self.catalog.get(path).await {
            Some(existing) => {
                if succeeded.contains(&existing.provider) {
                    self.catalog
                        .upsert(StoredFile {
                            size_bytes: size,
                            mime_type: mime_type.clone(),
                            uploaded_at: Utc::now(),
                            ..existing.clone()
                        })
                        .await?;
                }
                Some(existing.provider)
            }
            None => {
                let preferred = self.preferred().await;
                let chosen = if succeeded.contains(&preferred) {
                    Some(preferred)
                } else {
                    succeeded.first().copied()
                };
                if let Some(provider) = chosen {
                    self.catalog
                        .upsert(StoredFile {
                            path: path.to_string(),
                            provider,
                            size_bytes: size,
                            mime_type,
                            uploaded_at: Utc::now(),
                        })
                        .await?;
                }
                chosen
            }
        };

        info!(
            path = %path,
            status = ?status,
            succeeded = succeeded.len(),
            attempted = outcomes.len(),
            "File synced across providers"
        );
        Ok(SyncOutcome {
            path: path.to_string(),
            status,
            targets: outcomes,
            canonical,
        })
    }

    /// Read a file from its canonical provider, falling back to any healthy
    /// provider that holds a copy
    ///
    /// A read never changes the catalog record.
    pub async fn read(&self, path: &str) -> Result<FileContent, ReadError> {
        validate_path(path).map_err(ReadError::InvalidPath)?;
        let file = self.catalog.get(path).await.ok_or_else(|| ReadError::NotFound {
            path: path.to_string(),
        })?;

        let canonical = file.provider;
        let primary_error = match self.configured(canonical) {
            Ok(backend) => {
                let result = with_timeout(self.timeout, backend.get(path)).await;
                record_storage_operation(canonical.as_str(), "get", result.is_ok());
                match result {
                    Ok(data) => {
                        return Ok(FileContent {
                            file,
                            served_by: canonical,
                            data,
                        })
                    }
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        for backend in self.registry.backends() {
            let name = backend.name();
            if name == canonical || !self.monitor.probe(ProbeTarget::Provider(name)).await.healthy {
                continue;
            }
            if let Ok(data) = with_timeout(self.timeout, backend.get(path)).await {
                warn!(path = %path, canonical = %canonical, served_by = %name, error = %primary_error, "Served file from shadow copy");
                return Ok(FileContent {
                    file,
                    served_by: name,
                    data,
                });
            }
        }

        if primary_error.is_not_found() {
            Err(ReadError::NotFound {
                path: path.to_string(),
            })
        } else {
            Err(ReadError::Unavailable {
                provider: canonical,
                path: path.to_string(),
                source: primary_error,
            })
        }
    }

    /// Address of the canonical copy
    pub async fn resolve_url(&self, path: &str) -> Result<String, ReadError> {
        validate_path(path).map_err(ReadError::InvalidPath)?;
        let file = self.catalog.get(path).await.ok_or_else(|| ReadError::NotFound {
            path: path.to_string(),
        })?;
        let backend = self.configured(file.provider).map_err(|source| ReadError::Unavailable {
            provider: file.provider,
            path: path.to_string(),
            source,
        })?;
        Ok(backend.url(path))
    }

    /// Delete a file from its canonical provider only
    ///
    /// Shadow copies on other providers are left in place; cleanup reports
    /// them as orphans. An object that is already gone still has its record
    /// removed; any other failure keeps the record.
    pub async fn delete(&self, path: &str) -> Result<StoredFile, DeleteError> {
        let file = self.catalog.get(path).await.ok_or_else(|| DeleteError::NotFound {
            path: path.to_string(),
        })?;
        let provider = file.provider;
        let backend = self
            .configured(provider)
            .map_err(|source| DeleteError::Backend { provider, source })?;

        let result = with_timeout(self.timeout, backend.delete(path)).await;
        record_storage_operation(provider.as_str(), "delete", result.is_ok());
        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(path = %path, provider = %provider, "Object already absent, removing record");
            }
            Err(source) => return Err(DeleteError::Backend { provider, source }),
        }

        self.catalog.remove(path).await?;
        info!(path = %path, provider = %provider, "File deleted");
        Ok(file)
    }

    /// Every catalog record
    pub async fn list_files(&self) -> Vec<StoredFile> {
        self.catalog.list().await
    }
}

fn resolve_mime(path: &str, declared: Option<&str>) -> String {
    match declared.map(str::trim).filter(|m| !m.is_empty()) {
        Some(mime) => mime.to_string(),
        None => mime_guess::from_path(path).first_or_octet_stream().to_string(),
    }
}
