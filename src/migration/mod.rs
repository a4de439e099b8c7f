//! Migration Tracker
//!
//! Bulk copy of every file from one provider to another. `start` validates
//! and returns; the copy loop runs as its own task and publishes counters
//! into a status record that callers poll. Only one migration runs at a
//! time, and a second `start` is rejected rather than queued.
//!
//! A failing file is counted and recorded, and the run moves on. The run
//! only stops early when a provider it depends on is found unreachable by
//! a fresh probe, or when an operator cancels it.

mod cleanup;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{CatalogError, FileCatalog};
use crate::errors::{with_timeout, BackendError, Classify, ErrorKind};
use crate::health::{HealthMonitor, ProbeTarget};
use crate::metrics::{record_storage_operation, MIGRATION_FILES};
use crate::storage::{LimitViolation, ObjectInfo, ProviderName, ProviderRegistry, StorageBackend};

pub use cleanup::{CleanupError, CleanupPolicy, CleanupSummary};

/// Lifecycle of the most recent migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationState {
    Idle,
    Running,
    Completed,
    Aborted,
    Cancelled,
}

/// Progress of the current or most recent migration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    pub id: Option<Uuid>,
    pub source: Option<ProviderName>,
    pub destination: Option<ProviderName>,
    pub state: MigrationState,
    pub total_files: u64,
    pub migrated_files: u64,
    pub failed_files: u64,
    pub in_progress: bool,
    pub errors: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// When the last run finished, however it finished
    pub last_migration: Option<DateTime<Utc>>,
}

impl Default for MigrationStatus {
    fn default() -> Self {
        Self {
            id: None,
            source: None,
            destination: None,
            state: MigrationState::Idle,
            total_files: 0,
            migrated_files: 0,
            failed_files: 0,
            in_progress: false,
            errors: Vec::new(),
            started_at: None,
            last_migration: None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MigrationStartError {
    #[error("a migration is already running")]
    AlreadyRunning,

    #[error("a cleanup is running")]
    CleanupRunning,

    #[error("source and destination are both {0}")]
    SameProvider(ProviderName),

    #[error("provider {provider} is unavailable: {detail}")]
    ProviderUnavailable { provider: ProviderName, detail: String },
}

impl Classify for MigrationStartError {
    fn kind(&self) -> ErrorKind {
        match self {
            MigrationStartError::AlreadyRunning | MigrationStartError::CleanupRunning => ErrorKind::AlreadyInProgress,
            MigrationStartError::SameProvider(_) => ErrorKind::InvalidRequest,
            MigrationStartError::ProviderUnavailable { .. } => ErrorKind::PreconditionFailed,
        }
    }

    fn backend(&self) -> Option<String> {
        match self {
            MigrationStartError::ProviderUnavailable { provider, .. } => Some(provider.to_string()),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MigrationCancelError {
    #[error("no migration is running")]
    NotRunning,
}

impl Classify for MigrationCancelError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::PreconditionFailed
    }
}

/// Why a single file could not be migrated
#[derive(Error, Debug)]
enum CopyError {
    #[error("read from {provider} failed: {source}")]
    Read {
        provider: ProviderName,
        source: BackendError,
    },

    #[error("rejected by {provider}: {violation}")]
    Rejected {
        provider: ProviderName,
        violation: LimitViolation,
    },

    #[error("write to {provider} failed: {source}")]
    Write {
        provider: ProviderName,
        source: BackendError,
    },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl CopyError {
    /// Provider to re-probe when the failure looks backend-wide
    fn unreachable_provider(&self) -> Option<ProviderName> {
        match self {
            CopyError::Read { provider, source } | CopyError::Write { provider, source } if source.is_unreachable() => {
                Some(*provider)
            }
            _ => None,
        }
    }
}

struct TrackerState {
    status: MigrationStatus,
    cancel: Option<CancellationToken>,
}

/// Migration tracker
pub struct MigrationTracker {
    registry: Arc<ProviderRegistry>,
    monitor: Arc<HealthMonitor>,
    catalog: Arc<FileCatalog>,
    timeout: Duration,
    cleanup_policy: CleanupPolicy,
    state: Arc<RwLock<TrackerState>>,
    cleanup_running: Arc<AtomicBool>,
}

impl MigrationTracker {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        monitor: Arc<HealthMonitor>,
        catalog: Arc<FileCatalog>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            monitor,
            catalog,
            timeout,
            cleanup_policy: CleanupPolicy::default(),
            state: Arc::new(RwLock::new(TrackerState {
                status: MigrationStatus::default(),
                cancel: None,
            })),
            cleanup_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup_policy = policy;
        self
    }

    /// Snapshot of the current or most recent run
    pub async fn status(&self) -> MigrationStatus {
        self.state.read().await.status.clone()
    }

    async fn require_healthy(&self, provider: ProviderName) -> Result<Arc<dyn StorageBackend>, MigrationStartError> {
        let unavailable = |detail: String| MigrationStartError::ProviderUnavailable { provider, detail };
        let backend = self
            .registry
            .backend(provider)
            .ok_or_else(|| unavailable(BackendError::NotConfigured.to_string()))?;
        let probe = self.monitor.probe_fresh(ProbeTarget::Provider(provider)).await;
        if !probe.healthy {
            return Err(unavailable(probe.detail.unwrap_or_else(|| "unhealthy".to_string())));
        }
        Ok(backend)
    }

    /// Begin migrating every file of `source` to `destination`
    ///
    /// Returns once preconditions hold and the run has been spawned.
    pub async fn start(&self, source: ProviderName, destination: ProviderName) -> Result<Uuid, MigrationStartError> {
        if self.state.read().await.status.in_progress {
            return Err(MigrationStartError::AlreadyRunning);
        }
        if source == destination {
            return Err(MigrationStartError::SameProvider(source));
        }
        let source_backend = self.require_healthy(source).await?;
        let destination_backend = self.require_healthy(destination).await?;

        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        {
            let mut state = self.state.write().await;
            if state.status.in_progress {
                return Err(MigrationStartError::AlreadyRunning);
            }
            if self.cleanup_running.load(Ordering::SeqCst) {
                return Err(MigrationStartError::CleanupRunning);
            }
            state.status = MigrationStatus {
                id: Some(id),
                source: Some(source),
                destination: Some(destination),
                state: MigrationState::Running,
                in_progress: true,
                started_at: Some(Utc::now()),
                last_migration: state.status.last_migration,
                ..MigrationStatus::default()
            };
            state.cancel = Some(token.clone());
        }

        let run = MigrationRun {
            source: source_backend,
            destination: destination_backend,
            registry: self.registry.clone(),
            monitor: self.monitor.clone(),
            catalog: self.catalog.clone(),
            timeout: self.timeout,
            state: self.state.clone(),
            token,
        };
        tokio::spawn(run.execute());

        info!(id = %id, source = %source, destination = %destination, "Migration started");
        Ok(id)
    }

    /// Ask the running migration to stop after the file in flight
    pub async fn cancel(&self) -> Result<(), MigrationCancelError> {
        let state = self.state.read().await;
        match (&state.cancel, state.status.in_progress) {
            (Some(token), true) => {
                token.cancel();
                info!(id = ?state.status.id, "Migration cancellation requested");
                Ok(())
            }
            _ => Err(MigrationCancelError::NotRunning),
        }
    }
}

/// Everything a spawned run needs, detached from the tracker's lifetime
struct MigrationRun {
    source: Arc<dyn StorageBackend>,
    destination: Arc<dyn StorageBackend>,
    registry: Arc<ProviderRegistry>,
    monitor: Arc<HealthMonitor>,
    catalog: Arc<FileCatalog>,
    timeout: Duration,
    state: Arc<RwLock<TrackerState>>,
    token: CancellationToken,
}

impl MigrationRun {
    async fn execute(self) {
        let source = self.source.name();
        let final_state = match with_timeout(self.timeout, self.source.list("")).await {
            Ok(objects) => {
                self.state.write().await.status.total_files = objects.len() as u64;
                self.copy_all(&objects).await
            }
            Err(e) => {
                error!(source = %source, error = %e, "Migration aborted: listing failed");
                self.state
                    .write()
                    .await
                    .status
                    .errors
                    .push(format!("listing {} failed: {}", source, e));
                MigrationState::Aborted
            }
        };

        let mut state = self.state.write().await;
        state.status.state = final_state;
        state.status.in_progress = false;
        state.status.last_migration = Some(Utc::now());
        state.cancel = None;
        info!(
            id = ?state.status.id,
            state = ?final_state,
            total = state.status.total_files,
            migrated = state.status.migrated_files,
            failed = state.status.failed_files,
            "Migration finished"
        );
    }

    async fn copy_all(&self, objects: &[ObjectInfo]) -> MigrationState {
        for object in objects {
            if self.token.is_cancelled() {
                let id = self.state.read().await.status.id;
                warn!(id = ?id, "Migration cancelled");
                return MigrationState::Cancelled;
            }

            match self.copy_one(&object.path).await {
                Ok(()) => {
                    MIGRATION_FILES.with_label_values(&["migrated"]).inc();
                    self.state.write().await.status.migrated_files += 1;
                }
                Err(e) => {
                    MIGRATION_FILES.with_label_values(&["failed"]).inc();
                    warn!(path = %object.path, error = %e, "File migration failed");
                    {
                        let mut state = self.state.write().await;
                        state.status.failed_files += 1;
                        state.status.errors.push(format!("{}: {}", object.path, e));
                    }

                    if let Some(provider) = e.unreachable_provider() {
                        let probe = self.monitor.probe_fresh(ProbeTarget::Provider(provider)).await;
                        if !probe.healthy {
                            error!(provider = %provider, "Migration aborted: provider unreachable");
                            self.state
                                .write()
                                .await
                                .status
                                .errors
                                .push(format!("aborted: {} is unreachable", provider));
                            return MigrationState::Aborted;
                        }
                    }
                }
            }
        }
        MigrationState::Completed
    }

    async fn copy_one(&self, path: &str) -> Result<(), CopyError> {
        let source = self.source.name();
        let destination = self.destination.name();

        let read = with_timeout(self.timeout, self.source.get(path)).await;
        record_storage_operation(source.as_str(), "get", read.is_ok());
        let data: Bytes = read.map_err(|source_err| CopyError::Read {
            provider: source,
            source: source_err,
        })?;

        if let Some(limits) = self.registry.limits(destination) {
            let mime_type = match self.catalog.get(path).await {
                Some(record) => record.mime_type,
                None => mime_guess::from_path(path).first_or_octet_stream().to_string(),
            };
            limits
                .validate(data.len() as u64, &mime_type)
                .map_err(|violation| CopyError::Rejected {
                    provider: destination,
                    violation,
                })?;
        }

        let write = with_timeout(self.timeout, self.destination.put(path, data)).await;
        record_storage_operation(destination.as_str(), "put", write.is_ok());
        write.map_err(|e| CopyError::Write {
            provider: destination,
            source: e,
        })?;

        // The source object stays behind as a shadow copy.
        self.catalog.repoint(path, source, destination).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::fixture;
    use crate::testing::wait_for_migration;

    #[tokio::test]
    async fn test_per_file_failure_does_not_stop_the_run() {
        let f = fixture();
        for i in 1..=10 {
            f.coordinator
                .store(&format!("batch/file{:02}.txt", i), Bytes::from_static(b"data"), None, None)
                .await
                .unwrap();
        }
        f.cloud_a.fail_puts("batch/file04.txt", 1);

        let tracker = f.coordinator.migrations();
        tracker.start(ProviderName::Local, ProviderName::CloudA).await.unwrap();
        let status = wait_for_migration(tracker).await;

        assert_eq!(status.state, MigrationState::Completed);
        assert!(!status.in_progress);
        assert_eq!(status.total_files, 10);
        assert_eq!(status.migrated_files, 9);
        assert_eq!(status.failed_files, 1);
        assert_eq!(status.migrated_files + status.failed_files, status.total_files);
        assert_eq!(status.errors.len(), 1);
        assert!(status.errors[0].starts_with("batch/file04.txt: "));
        assert!(status.last_migration.is_some());

        let catalog = f.coordinator.catalog();
        assert_eq!(catalog.get("batch/file01.txt").await.unwrap().provider, ProviderName::CloudA);
        assert_eq!(catalog.get("batch/file04.txt").await.unwrap().provider, ProviderName::Local);
        assert!(f.local.contains("batch/file01.txt").await);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_running() {
        let f = fixture();
        for i in 0..5 {
            f.local.seed(&format!("f{}.txt", i), b"x").await;
        }
        f.cloud_b.set_latency(Duration::from_millis(20));

        let tracker = f.coordinator.migrations();
        let id = tracker.start(ProviderName::Local, ProviderName::CloudB).await.unwrap();

        let err = tracker.start(ProviderName::CloudA, ProviderName::Local).await.unwrap_err();
        assert_eq!(err, MigrationStartError::AlreadyRunning);
        assert_eq!(err.kind(), ErrorKind::AlreadyInProgress);

        let status = wait_for_migration(tracker).await;
        assert_eq!(status.id, Some(id));
        assert_eq!(status.source, Some(ProviderName::Local));
        assert_eq!(status.total_files, 5);
        assert_eq!(status.migrated_files, 5);
        assert!(status.errors.is_empty());
    }

    #[tokio::test]
    async fn test_start_preconditions() {
        let f = fixture();
        let tracker = f.coordinator.migrations();

        assert_eq!(
            tracker.start(ProviderName::Local, ProviderName::Local).await,
            Err(MigrationStartError::SameProvider(ProviderName::Local))
        );

        f.cloud_b.set_unreachable(true);
        let err = tracker.start(ProviderName::Local, ProviderName::CloudB).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert_eq!(err.backend().as_deref(), Some("cloud-b"));
        assert_eq!(tracker.status().await.state, MigrationState::Idle);
    }

    #[tokio::test]
    async fn test_unreachable_destination_aborts_run() {
        let f = fixture();
        for i in 0..6 {
            f.local.seed(&format!("f{}.txt", i), b"x").await;
        }
        f.cloud_a.go_down_after_puts(2);

        let tracker = f.coordinator.migrations();
        tracker.start(ProviderName::Local, ProviderName::CloudA).await.unwrap();
        let status = wait_for_migration(tracker).await;

        assert_eq!(status.state, MigrationState::Aborted);
        assert!(!status.in_progress);
        assert_eq!(status.migrated_files, 2);
        assert_eq!(status.failed_files, 1);
        assert_eq!(status.total_files, 6);
        assert_eq!(status.errors.last().map(String::as_str), Some("aborted: cloud-a is unreachable"));
    }

    #[tokio::test]
    async fn test_cancel_stops_between_files() {
        let f = fixture();
        for i in 0..10 {
            f.local.seed(&format!("f{}.txt", i), b"x").await;
        }
        f.cloud_a.set_latency(Duration::from_millis(20));

        let tracker = f.coordinator.migrations();
        assert_eq!(tracker.cancel().await, Err(MigrationCancelError::NotRunning));

        tracker.start(ProviderName::Local, ProviderName::CloudA).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.cancel().await.unwrap();
        let status = wait_for_migration(tracker).await;

        assert_eq!(status.state, MigrationState::Cancelled);
        assert!(!status.in_progress);
        assert!(status.migrated_files < 10);
        assert_eq!(status.failed_files, 0);

        // a new run may start once the cancelled one has stopped
        tracker.start(ProviderName::Local, ProviderName::CloudA).await.unwrap();
        assert_eq!(wait_for_migration(tracker).await.state, MigrationState::Completed);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(MigrationStatus::default()).unwrap();
        assert_eq!(json["inProgress"], false);
        assert_eq!(json["migratedFiles"], 0);
        assert_eq!(json["state"], "idle");
        assert!(json["lastMigration"].is_null());
    }
}
