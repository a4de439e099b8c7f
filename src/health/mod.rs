//! Backend Health Monitor
//!
//! Probes databases and storage providers on demand. The monitor only
//! reports; deciding what to do with a result is left to the storage
//! coordinator and the failover controller.
//!
//! Every probe is bounded by the configured timeout and never returns an
//! error: connectivity failures, credential failures and timeouts all come
//! back as `healthy = false` with a distinguishing `detail`.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::HealthConfig;
use crate::database::{DatabaseEngine, DatabaseRole};
use crate::errors::{with_timeout, BackendError};
use crate::metrics::{PROBE_DURATION, PROBE_RESULTS};
use crate::storage::{ProviderName, StorageBackend};

/// Something the monitor can probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeTarget {
    Database(DatabaseRole),
    Provider(ProviderName),
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeTarget::Database(role) => write!(f, "database:{}", role),
            ProbeTarget::Provider(name) => write!(f, "provider:{}", name),
        }
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResult {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub latency_ms: u64,
}

impl HealthResult {
    fn healthy(latency: Duration) -> Self {
        Self {
            healthy: true,
            detail: None,
            checked_at: Utc::now(),
            latency_ms: latency.as_millis() as u64,
        }
    }

    fn unhealthy(error: &BackendError, latency: Duration) -> Self {
        Self {
            healthy: false,
            detail: Some(error.to_string()),
            checked_at: Utc::now(),
            latency_ms: latency.as_millis() as u64,
        }
    }
}

enum Probe {
    Database(Arc<dyn DatabaseEngine>),
    Provider(Arc<dyn StorageBackend>),
}

struct CachedResult {
    at: Instant,
    result: HealthResult,
}

/// Health monitor
pub struct HealthMonitor {
    timeout: Duration,
    cache_ttl: Duration,
    probes: HashMap<ProbeTarget, Probe>,
    cache: RwLock<HashMap<ProbeTarget, CachedResult>>,
}

impl HealthMonitor {
    /// Create a new health monitor with no registered targets
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            timeout: config.probe_timeout(),
            cache_ttl: config.cache_ttl(),
            probes: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register a storage provider for probing
    pub fn with_provider(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.probes
            .insert(ProbeTarget::Provider(backend.name()), Probe::Provider(backend));
        self
    }

    /// Register every provider of a registry
    pub fn with_providers(self, backends: impl IntoIterator<Item = Arc<dyn StorageBackend>>) -> Self {
        backends.into_iter().fold(self, |monitor, backend| monitor.with_provider(backend))
    }

    /// Register a database for probing
    pub fn with_database(mut self, engine: Arc<dyn DatabaseEngine>) -> Self {
        self.probes
            .insert(ProbeTarget::Database(engine.role()), Probe::Database(engine));
        self
    }

    /// Probe a target, reusing a result younger than the cache TTL
    pub async fn probe(&self, target: ProbeTarget) -> HealthResult {
        if !self.cache_ttl.is_zero() {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&target) {
                if cached.at.elapsed() < self.cache_ttl {
                    return cached.result.clone();
                }
            }
        }
        self.probe_fresh(target).await
    }

    /// Probe a target, ignoring any cached result
    ///
    /// Used immediately before committing a switch or preference change.
    pub async fn probe_fresh(&self, target: ProbeTarget) -> HealthResult {
        let started = Instant::now();
        let outcome = match self.probes.get(&target) {
            None => Err(BackendError::NotConfigured),
            Some(Probe::Database(engine)) => with_timeout(self.timeout, engine.ping()).await,
            Some(Probe::Provider(backend)) => with_timeout(self.timeout, backend.check()).await,
        };
        let latency = started.elapsed();

        let result = match outcome {
            Ok(()) => HealthResult::healthy(latency),
            Err(e) => {
                if !matches!(e, BackendError::NotConfigured) {
                    warn!(probe = %target, error = %e, "Health probe failed");
                }
                HealthResult::unhealthy(&e, latency)
            }
        };
        debug!(probe = %target, healthy = result.healthy, latency_ms = result.latency_ms, "Health probe");

        let label = target.to_string();
        PROBE_RESULTS
            .with_label_values(&[label.as_str(), if result.healthy { "healthy" } else { "unhealthy" }])
            .inc();
        PROBE_DURATION.observe(latency.as_secs_f64());

        if !self.cache_ttl.is_zero() {
            self.cache.write().await.insert(
                target,
                CachedResult {
                    at: Instant::now(),
                    result: result.clone(),
                },
            );
        }

        result
    }

    /// Probe several targets concurrently; results keep the input order
    pub async fn probe_many(&self, targets: &[ProbeTarget]) -> Vec<(ProbeTarget, HealthResult)> {
        let results = join_all(targets.iter().map(|target| self.probe(*target))).await;
        targets.iter().copied().zip(results).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, FakeDatabase};

    fn config(cache_ttl_secs: u64) -> HealthConfig {
        HealthConfig {
            probe_timeout_ms: 50,
            cache_ttl_secs,
        }
    }

    #[tokio::test]
    async fn test_healthy_and_unconfigured_targets() {
        let backend = FakeBackend::new(ProviderName::Local);
        let monitor = HealthMonitor::new(&config(0)).with_provider(backend.clone());

        let result = monitor.probe(ProbeTarget::Provider(ProviderName::Local)).await;
        assert!(result.healthy);
        assert!(result.detail.is_none());

        let result = monitor.probe(ProbeTarget::Provider(ProviderName::CloudB)).await;
        assert!(!result.healthy);
        assert_eq!(result.detail.as_deref(), Some("not configured"));
    }

    #[tokio::test]
    async fn test_failures_are_distinguished() {
        let unreachable = FakeBackend::new(ProviderName::CloudA);
        unreachable.set_unreachable(true);
        let primary = FakeDatabase::new(DatabaseRole::Primary);
        primary.set_unauthorized(true);
        let backup = FakeDatabase::new(DatabaseRole::Backup);
        backup.set_hanging(true);

        let monitor = HealthMonitor::new(&config(0))
            .with_provider(unreachable)
            .with_database(primary)
            .with_database(backup);

        let results = monitor
            .probe_many(&[
                ProbeTarget::Provider(ProviderName::CloudA),
                ProbeTarget::Database(DatabaseRole::Primary),
                ProbeTarget::Database(DatabaseRole::Backup),
            ])
            .await;

        assert!(results.iter().all(|(_, r)| !r.healthy));
        assert!(results[0].1.detail.as_deref().unwrap().starts_with("unreachable"));
        assert!(results[1].1.detail.as_deref().unwrap().starts_with("authentication failed"));
        assert!(results[2].1.detail.as_deref().unwrap().starts_with("timed out"));
    }

    #[tokio::test]
    async fn test_cache_is_bypassed_by_fresh_probe() {
        let backend = FakeBackend::new(ProviderName::Local);
        let monitor = HealthMonitor::new(&config(60)).with_provider(backend.clone());
        let target = ProbeTarget::Provider(ProviderName::Local);

        assert!(monitor.probe(target).await.healthy);
        backend.set_unreachable(true);

        // cached result still served to status reads
        assert!(monitor.probe(target).await.healthy);
        // but never to a commit decision
        assert!(!monitor.probe_fresh(target).await.healthy);
        assert!(!monitor.probe(target).await.healthy);
    }
}
