//! Orphan and broken-link reconciliation
//!
//! Cleanup prefers leaving garbage behind to losing data. An object is only
//! deleted when its provider listed it, it has no catalog record, it is older
//! than the grace period, a head request still finds it and the catalog has
//! been re-checked. A record is only re-pointed when its provider positively
//! reports the object missing and another provider holds a copy.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::MigrationTracker;
use crate::catalog::StoredFile;
use crate::errors::{with_timeout, Classify, ErrorKind};
use crate::health::ProbeTarget;
use crate::metrics::record_storage_operation;
use crate::storage::{ObjectInfo, ProviderName, StorageBackend};

/// How cleanup treats orphaned objects
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CleanupPolicy {
    /// Objects younger than this are left alone
    pub grace: Duration,
    /// Delete orphans, or only report them
    pub delete_orphans: bool,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3600),
            delete_orphans: false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CleanupError {
    #[error("cleanup is not allowed while a migration is running")]
    MigrationRunning,

    #[error("a cleanup is already running")]
    AlreadyRunning,
}

impl Classify for CleanupError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::AlreadyInProgress
    }
}

/// What one cleanup pass found and did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSummary {
    pub scanned_objects: u64,
    pub orphans_found: u64,
    pub orphans_deleted: u64,
    /// Orphans reported but kept because deletion is disabled
    pub orphans_retained: u64,
    pub broken_links_found: u64,
    pub broken_links_repaired: u64,
    /// Paths whose record points at a missing object with no copy elsewhere
    pub unrepairable: Vec<String>,
    /// Objects or records whose state could not be verified
    pub skipped: u64,
    /// Providers that were unhealthy or could not be listed
    pub skipped_providers: Vec<ProviderName>,
    pub errors: Vec<String>,
}

struct CleanupGuard(Arc<AtomicBool>);

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl MigrationTracker {
    /// Reconcile provider contents with the catalog
    pub async fn cleanup(&self) -> Result<CleanupSummary, CleanupError> {
        let _guard = {
            let state = self.state.read().await;
            if state.status.in_progress {
                return Err(CleanupError::MigrationRunning);
            }
            if self.cleanup_running.swap(true, Ordering::SeqCst) {
                return Err(CleanupError::AlreadyRunning);
            }
            CleanupGuard(self.cleanup_running.clone())
        };

        info!(delete_orphans = self.cleanup_policy.delete_orphans, "Cleanup started");
        let mut summary = CleanupSummary::default();

        let mut reachable = Vec::new();
        for backend in self.registry.backends() {
            let name = backend.name();
            let probe = self.monitor.probe_fresh(ProbeTarget::Provider(name)).await;
            if probe.healthy {
                reachable.push(backend);
            } else {
                warn!(provider = %name, "Skipping unhealthy provider during cleanup");
                summary.skipped_providers.push(name);
            }
        }

        let mut listed = Vec::new();
        for backend in reachable {
            let name = backend.name();
            match with_timeout(self.timeout, backend.list("")).await {
                Ok(objects) => {
                    summary.scanned_objects += objects.len() as u64;
                    self.reconcile_orphans(backend.as_ref(), &objects, &mut summary).await;
                    listed.push(backend);
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "Listing failed during cleanup");
                    summary.skipped_providers.push(name);
                    summary.errors.push(format!("listing {} failed: {}", name, e));
                }
            }
        }

        for record in self.catalog.list().await {
            self.check_link(&record, &listed, &mut summary).await;
        }

        info!(
            scanned = summary.scanned_objects,
            orphans_found = summary.orphans_found,
            orphans_deleted = summary.orphans_deleted,
            broken_links_found = summary.broken_links_found,
            broken_links_repaired = summary.broken_links_repaired,
            skipped = summary.skipped,
            "Cleanup finished"
        );
        Ok(summary)
    }

    async fn reconcile_orphans(&self, backend: &dyn StorageBackend, objects: &[ObjectInfo], summary: &mut CleanupSummary) {
        let name = backend.name();
        let grace = chrono::Duration::from_std(self.cleanup_policy.grace).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        for object in objects {
            if self.catalog.contains(&object.path).await {
                continue;
            }
            if now.signed_duration_since(object.last_modified) < grace {
                debug!(provider = %name, path = %object.path, "Unrecorded object within grace period");
                summary.skipped += 1;
                continue;
            }

            summary.orphans_found += 1;
            if !self.cleanup_policy.delete_orphans {
                summary.orphans_retained += 1;
                continue;
            }

            match with_timeout(self.timeout, backend.head(&object.path)).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    summary.skipped += 1;
                    summary.errors.push(format!("{}/{}: {}", name, object.path, e));
                    continue;
                }
            }
            // A store may have recorded the path since the listing.
            if self.catalog.contains(&object.path).await {
                summary.orphans_found -= 1;
                continue;
            }

            let result = with_timeout(self.timeout, backend.delete(&object.path)).await;
            record_storage_operation(name.as_str(), "delete", result.is_ok());
            match result {
                Ok(()) => {
                    info!(provider = %name, path = %object.path, "Deleted orphaned object");
                    summary.orphans_deleted += 1;
                }
                Err(e) => {
                    warn!(provider = %name, path = %object.path, error = %e, "Failed to delete orphaned object");
                    summary.errors.push(format!("{}/{}: {}", name, object.path, e));
                }
            }
        }
    }

    async fn check_link(&self, record: &StoredFile, listed: &[Arc<dyn StorageBackend>], summary: &mut CleanupSummary) {
        let Some(canonical) = listed.iter().find(|b| b.name() == record.provider) else {
            summary.skipped += 1;
            return;
        };

        match with_timeout(self.timeout, canonical.head(&record.path)).await {
            Ok(_) => return,
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                summary.skipped += 1;
                summary.errors.push(format!("{}/{}: {}", record.provider, record.path, e));
                return;
            }
        }

        summary.broken_links_found += 1;
        for backend in listed.iter().filter(|b| b.name() != record.provider) {
            if with_timeout(self.timeout, backend.head(&record.path)).await.is_err() {
                continue;
            }
            match self.catalog.repoint(&record.path, record.provider, backend.name()).await {
                Ok(true) => {
                    info!(path = %record.path, from = %record.provider, to = %backend.name(), "Repaired broken link");
                    summary.broken_links_repaired += 1;
                    return;
                }
                // The record changed underneath; leave it to the next pass.
                Ok(false) => {
                    summary.skipped += 1;
                    return;
                }
                Err(e) => {
                    summary.errors.push(format!("{}: {}", record.path, e));
                    return;
                }
            }
        }

        warn!(path = %record.path, provider = %record.provider, "Broken link has no copy to repair from");
        summary.unrepairable.push(record.path.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::fixture;
    use crate::coordinator::StorageCoordinator;
    use crate::testing::FakeBackend;
    use bytes::Bytes;

    fn eager(coordinator: StorageCoordinator) -> StorageCoordinator {
        coordinator.with_cleanup_policy(CleanupPolicy {
            grace: Duration::ZERO,
            delete_orphans: true,
        })
    }

    async fn remove_object(backend: &FakeBackend, path: &str) {
        backend.delete(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_orphaned_shadow_copy_is_deleted() {
        let mut f = fixture();
        f.coordinator = eager(f.coordinator);
        f.coordinator
            .sync_file_across_providers(
                "old/report.csv",
                Bytes::from_static(b"a,b"),
                None,
                &[ProviderName::Local, ProviderName::CloudB],
            )
            .await
            .unwrap();
        f.coordinator
            .store("live.txt", Bytes::from_static(b"keep"), None, None)
            .await
            .unwrap();
        f.coordinator.delete("old/report.csv").await.unwrap();

        let summary = f.coordinator.migrations().cleanup().await.unwrap();
        assert_eq!(summary.scanned_objects, 2);
        assert_eq!(summary.orphans_found, 1);
        assert_eq!(summary.orphans_deleted, 1);
        assert!(!f.cloud_b.contains("old/report.csv").await);
        assert!(f.local.contains("live.txt").await);
    }

    #[tokio::test]
    async fn test_orphans_are_retained_by_default() {
        let f = fixture();
        f.cloud_a.seed("stray.bin", b"??").await;

        let summary = f.coordinator.migrations().cleanup().await.unwrap();
        // default grace period protects fresh objects
        assert_eq!(summary.orphans_found, 0);
        assert_eq!(summary.skipped, 1);
        assert!(f.cloud_a.contains("stray.bin").await);

        let f = fixture();
        f.cloud_a.seed("stray.bin", b"??").await;
        let coordinator = f.coordinator.with_cleanup_policy(CleanupPolicy {
            grace: Duration::ZERO,
            delete_orphans: false,
        });
        let summary = coordinator.migrations().cleanup().await.unwrap();
        assert_eq!(summary.orphans_found, 1);
        assert_eq!(summary.orphans_retained, 1);
        assert_eq!(summary.orphans_deleted, 0);
        assert!(f.cloud_a.contains("stray.bin").await);
    }

    #[tokio::test]
    async fn test_broken_link_is_repaired_from_copy() {
        let mut f = fixture();
        f.coordinator = eager(f.coordinator);
        f.coordinator
            .sync_file_across_providers(
                "scan.png",
                Bytes::from_static(b"png"),
                None,
                &[ProviderName::Local, ProviderName::CloudA],
            )
            .await
            .unwrap();
        f.coordinator
            .store("lost.txt", Bytes::from_static(b"gone"), None, None)
            .await
            .unwrap();
        remove_object(&f.local, "scan.png").await;
        remove_object(&f.local, "lost.txt").await;

        let summary = f.coordinator.migrations().cleanup().await.unwrap();
        assert_eq!(summary.broken_links_found, 2);
        assert_eq!(summary.broken_links_repaired, 1);
        assert_eq!(summary.unrepairable, vec!["lost.txt".to_string()]);

        let catalog = f.coordinator.catalog();
        assert_eq!(catalog.get("scan.png").await.unwrap().provider, ProviderName::CloudA);
        assert_eq!(catalog.get("lost.txt").await.unwrap().provider, ProviderName::Local);
        // the copy that is now canonical is no longer an orphan candidate
        assert!(f.cloud_a.contains("scan.png").await);
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_never_cleaned() {
        let mut f = fixture();
        f.coordinator = eager(f.coordinator);
        f.coordinator
            .store("a.txt", Bytes::from_static(b"a"), None, Some(ProviderName::CloudB))
            .await
            .unwrap();
        f.cloud_b.set_unreachable(true);

        let summary = f.coordinator.migrations().cleanup().await.unwrap();
        assert_eq!(summary.skipped_providers, vec![ProviderName::CloudB]);
        assert_eq!(summary.broken_links_found, 0);
        assert_eq!(summary.skipped, 1);
        assert_eq!(f.coordinator.catalog().get("a.txt").await.unwrap().provider, ProviderName::CloudB);
    }

    #[tokio::test]
    async fn test_cleanup_rejected_during_migration() {
        let f = fixture();
        for i in 0..5 {
            f.local.seed(&format!("f{}.txt", i), b"x").await;
        }
        f.cloud_a.set_latency(Duration::from_millis(20));

        let tracker = f.coordinator.migrations();
        tracker.start(ProviderName::Local, ProviderName::CloudA).await.unwrap();
        let err = tracker.cleanup().await.unwrap_err();
        assert_eq!(err, CleanupError::MigrationRunning);
        assert_eq!(err.kind(), ErrorKind::AlreadyInProgress);

        crate::testing::wait_for_migration(tracker).await;
        assert!(tracker.cleanup().await.is_ok());
    }
}
