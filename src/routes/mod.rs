//! HTTP routes of the coordinator API
//!
//! - GET /healthz, GET /ready, GET /metrics
//! - /api/database/* - health, backup initialization, switch, primary-to-backup sync
//! - /api/storage/* - provider status, preferred provider, file store/read/delete,
//!   multi-provider sync, URL resolution
//! - /api/migration/* - status, start, cancel, cleanup

mod handlers;

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

use crate::coordinator::StorageCoordinator;
use crate::failover::FailoverController;
use crate::metrics::HTTP_REQUESTS;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<StorageCoordinator>,
    pub failover: Arc<FailoverController>,
}

async fn track_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let response = next.run(request).await;
    HTTP_REQUESTS
        .with_label_values(&[method.as_str(), response.status().as_str()])
        .inc();
    response
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::metrics))
        .route("/api/database/health", get(handlers::database_health))
        .route("/api/database/backup/initialize", post(handlers::initialize_backup))
        .route("/api/database/switch", post(handlers::switch_database))
        .route("/api/database/sync", post(handlers::sync_database))
        .route("/api/storage/status", get(handlers::storage_status))
        .route("/api/storage/preferred", put(handlers::set_preferred))
        .route("/api/storage/files", get(handlers::list_files))
        .route(
            "/api/storage/files/*path",
            get(handlers::get_file)
                .put(handlers::put_file)
                .delete(handlers::delete_file),
        )
        .route("/api/storage/sync/*path", post(handlers::sync_file))
        .route("/api/storage/url/*path", get(handlers::file_url))
        .route("/api/migration/status", get(handlers::migration_status))
        .route("/api/migration/start", post(handlers::start_migration))
        .route("/api/migration/cancel", post(handlers::cancel_migration))
        .route("/api/migration/cleanup", post(handlers::cleanup))
        .layer(middleware::from_fn(track_requests))
        .with_state(state)
}
