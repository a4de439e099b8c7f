//! Request handlers for the coordinator API

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use tracing::{info, instrument};

use super::AppState;
use crate::coordinator::{StorageStatus, SyncStatus};
use crate::database::{DatabaseRole, InitOutcome};
use crate::errors::{ApiError, Result};
use crate::failover::{ActiveDatabase, DatabaseHealth, SyncSummary};
use crate::migration::{CleanupSummary, MigrationStatus};
use crate::storage::ProviderName;

/// Liveness probe
#[instrument]
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness probe: ready while the active database is healthy
#[instrument(skip(state))]
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.failover.health().await;
    let active_healthy = match health.active {
        ActiveDatabase::Primary => health.primary,
        ActiveDatabase::Backup => health.backup,
        ActiveDatabase::None => false,
    };
    if active_healthy {
        (StatusCode::OK, "Ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not ready")
    }
}

/// Prometheus metrics endpoint
#[instrument]
pub async fn metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = crate::metrics::REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ApiError::internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| ApiError::internal(format!("Metrics are not UTF-8: {}", e)))
}

#[derive(Debug, Deserialize)]
pub struct SwitchRequest {
    pub target: DatabaseRole,
}

#[derive(Debug, Deserialize)]
pub struct PreferredRequest {
    pub provider: ProviderName,
}

#[derive(Debug, Deserialize)]
pub struct StoreQuery {
    pub provider: Option<ProviderName>,
}

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    /// Comma-separated provider names
    #[serde(default)]
    pub targets: String,
}

#[derive(Debug, Deserialize)]
pub struct MigrationRequest {
    pub source: ProviderName,
    pub destination: ProviderName,
}

/// GET /api/database/health
#[instrument(skip(state))]
pub async fn database_health(State(state): State<AppState>) -> Json<DatabaseHealth> {
    Json(state.failover.health().await)
}

/// POST /api/database/backup/initialize
#[instrument(skip(state))]
pub async fn initialize_backup(State(state): State<AppState>) -> Result<Json<InitOutcome>> {
    Ok(Json(state.failover.initialize_backup().await?))
}

/// POST /api/database/switch
#[instrument(skip(state))]
pub async fn switch_database(
    State(state): State<AppState>,
    Json(request): Json<SwitchRequest>,
) -> Result<Json<serde_json::Value>> {
    info!(target_role = %request.target, "Database switch requested");
    state.failover.switch_to(request.target).await?;
    Ok(Json(json!({ "active": request.target })))
}

/// POST /api/database/sync
#[instrument(skip(state))]
pub async fn sync_database(State(state): State<AppState>) -> Result<Json<SyncSummary>> {
    Ok(Json(state.failover.sync_primary_to_backup().await?))
}

/// GET /api/storage/status
#[instrument(skip(state))]
pub async fn storage_status(State(state): State<AppState>) -> Json<StorageStatus> {
    Json(state.coordinator.status().await)
}

/// PUT /api/storage/preferred
#[instrument(skip(state))]
pub async fn set_preferred(
    State(state): State<AppState>,
    Json(request): Json<PreferredRequest>,
) -> Result<Json<serde_json::Value>> {
    state.coordinator.set_preferred(request.provider).await?;
    Ok(Json(json!({ "preferred": request.provider })))
}

/// GET /api/storage/files
#[instrument(skip(state))]
pub async fn list_files(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.list_files().await)
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok())
}

/// PUT /api/storage/files/*path
#[instrument(skip(state, headers, body), fields(size = body.len()))]
pub async fn put_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<StoreQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let file = state
        .coordinator
        .store(&path, body, content_type(&headers), query.provider)
        .await?;
    Ok((StatusCode::CREATED, Json(file)).into_response())
}

/// GET /api/storage/files/*path
#[instrument(skip(state))]
pub async fn get_file(State(state): State<AppState>, Path(path): Path<String>) -> Result<Response> {
    let content = state.coordinator.read(&path).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content.file.mime_type.as_str())
        .header(header::CONTENT_LENGTH, content.data.len())
        .header("x-served-by", content.served_by.as_str())
        .body(Body::from(content.data))
        .map_err(|e| ApiError::internal(format!("Failed to build response: {}", e)))
}

/// DELETE /api/storage/files/*path
#[instrument(skip(state))]
pub async fn delete_file(State(state): State<AppState>, Path(path): Path<String>) -> Result<Response> {
    let file = state.coordinator.delete(&path).await?;
    Ok(Json(file).into_response())
}

/// POST /api/storage/sync/*path?targets=a,b
#[instrument(skip(state, headers, body), fields(size = body.len()))]
pub async fn sync_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<SyncQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let targets = query
        .targets
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ProviderName::from_str)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(ApiError::invalid_request)?;

    let outcome = state
        .coordinator
        .sync_file_across_providers(&path, body, content_type(&headers), &targets)
        .await?;
    let status = match outcome.status {
        SyncStatus::Succeeded => StatusCode::OK,
        SyncStatus::PartialFailure => StatusCode::MULTI_STATUS,
        SyncStatus::Failed => StatusCode::BAD_GATEWAY,
    };
    Ok((status, Json(outcome)).into_response())
}

/// GET /api/storage/url/*path
#[instrument(skip(state))]
pub async fn file_url(State(state): State<AppState>, Path(path): Path<String>) -> Result<Json<serde_json::Value>> {
    let url = state.coordinator.resolve_url(&path).await?;
    Ok(Json(json!({ "path": path, "url": url })))
}

/// GET /api/migration/status
#[instrument(skip(state))]
pub async fn migration_status(State(state): State<AppState>) -> Json<MigrationStatus> {
    Json(state.coordinator.migrations().status().await)
}

/// POST /api/migration/start
#[instrument(skip(state))]
pub async fn start_migration(
    State(state): State<AppState>,
    Json(request): Json<MigrationRequest>,
) -> Result<Response> {
    let id = state
        .coordinator
        .migrations()
        .start(request.source, request.destination)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id }))).into_response())
}

/// POST /api/migration/cancel
#[instrument(skip(state))]
pub async fn cancel_migration(State(state): State<AppState>) -> Result<Response> {
    let migrations = state.coordinator.migrations();
    migrations.cancel().await?;
    Ok((StatusCode::ACCEPTED, Json(migrations.status().await)).into_response())
}

/// POST /api/migration/cleanup
#[instrument(skip(state))]
pub async fn cleanup(State(state): State<AppState>) -> Result<Json<CleanupSummary>> {
    Ok(Json(state.coordinator.migrations().cleanup().await?))
}
