//! HTTP server implementation
//!
//! Wires configuration into the coordinator state and serves the API with:
//! - Middleware (tracing, request timeout, compression, request metrics)
//! - Graceful shutdown

use anyhow::{bail, Context};
use axum::extract::DefaultBodyLimit;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::catalog::FileCatalog;
use crate::config::Config;
use crate::coordinator::StorageCoordinator;
use crate::database::{DatabaseAdapter, DatabaseEngine, DatabaseRole, PgDatabase, Schema};
use crate::failover::FailoverController;
use crate::health::HealthMonitor;
use crate::migration::CleanupPolicy;
use crate::routes::{self, AppState};
use crate::storage;

/// Build the coordinator state described by `config`
///
/// Database pools connect lazily, so unreachable backends surface as
/// unhealthy probes rather than startup failures.
pub async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let db = &config.database;
    let (Some(primary_url), Some(backup_url)) = (&db.primary_url, &db.backup_url) else {
        bail!("both database.primary_url and database.backup_url must be configured");
    };
    let acquire_timeout = config.health.probe_timeout();
    let primary: Arc<dyn DatabaseEngine> = Arc::new(
        PgDatabase::connect_lazy(DatabaseRole::Primary, primary_url, db.max_connections, acquire_timeout)
            .context("invalid primary database URL")?,
    );
    let backup: Arc<dyn DatabaseEngine> = Arc::new(
        PgDatabase::connect_lazy(DatabaseRole::Backup, backup_url, db.max_connections, acquire_timeout)
            .context("invalid backup database URL")?,
    );

    let schema = match &db.schema_file {
        Some(path) => Schema::from_file(path).with_context(|| format!("loading schema {}", path.display()))?,
        None => Schema::default(),
    };

    let registry = Arc::new(storage::create_registry(&config.storage).await?);
    if !registry.contains(config.storage.preferred) {
        bail!("preferred provider {} is not configured", config.storage.preferred);
    }

    let monitor = Arc::new(
        HealthMonitor::new(&config.health)
            .with_providers(registry.backends())
            .with_database(primary.clone())
            .with_database(backup.clone()),
    );

    let catalog = match &config.storage.catalog_path {
        Some(path) => FileCatalog::open(path).await?,
        None => FileCatalog::in_memory(),
    };
    if config.storage.deletes_orphans() && !catalog.is_durable() {
        warn!("Orphan deletion is enabled with an in-memory catalog; every stored file looks orphaned after a restart");
    }

    let db_timeout = db.operation_timeout();
    let failover = FailoverController::new(
        DatabaseAdapter::new(primary, monitor.clone(), db_timeout),
        DatabaseAdapter::new(backup, monitor.clone(), db_timeout),
        monitor.clone(),
        schema,
        db.tables.clone(),
    );

    let coordinator = StorageCoordinator::new(
        registry,
        monitor,
        Arc::new(catalog),
        config.storage.preferred,
        config.storage.operation_timeout(),
    )
    .with_cleanup_policy(CleanupPolicy {
        grace: config.storage.orphan_grace(),
        delete_orphans: config.storage.deletes_orphans(),
    });

    Ok(AppState {
        coordinator: Arc::new(coordinator),
        failover: Arc::new(failover),
    })
}

/// HTTP server for the coordinator API
pub struct Server {
    config: Config,
    state: AppState,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the Axum router with all middleware
    fn build_router(&self) -> Router {
        routes::create_router(self.state.clone()).layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(self.config.server.timeout_secs)))
                .layer(CompressionLayer::new())
                .layer(DefaultBodyLimit::max(self.config.server.max_body_size))
                .into_inner(),
        )
    }

    /// Start the server and run until shutdown signal
    pub async fn start<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.build_router();

        let listener = tokio::net::TcpListener::bind(self.config.server.bind_address).await?;
        info!(address = %self.config.server.bind_address, "Server listening");

        axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_state_requires_both_databases() {
        let mut config = Config::default();
        config.database.backup_url = None;
        config.database.primary_url = Some("postgres://app@localhost/app".to_string());

        let err = build_state(&config).await.err().unwrap();
        assert!(err.to_string().contains("backup_url"));
    }

    #[tokio::test]
    async fn test_build_state_with_local_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.database.primary_url = Some("postgres://app@127.0.0.1:1/app".to_string());
        config.database.backup_url = Some("postgres://app@127.0.0.1:2/app".to_string());
        if let Some(local) = config.storage.local.as_mut() {
            local.root = dir.path().join("files");
        }
        config.storage.catalog_path = Some(dir.path().join("catalog.json"));

        let state = build_state(&config).await.unwrap();
        assert_eq!(state.coordinator.preferred().await, crate::storage::ProviderName::Local);
        assert!(state.coordinator.catalog().is_durable());
        assert_eq!(state.failover.active_role().await, None);
    }
}
