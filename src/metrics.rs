//! Prometheus metrics for hybridstore
//!
//! Defines metrics for:
//! - Request counts by method and status
//! - Storage operations by provider, operation and status
//! - Health probe results and latency
//! - Database switches and migration progress

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Registry for all metrics
    pub static ref REGISTRY: Registry = Registry::new();

    /// HTTP request counter by method and status
    pub static ref HTTP_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("hybridstore_http_requests_total", "Total HTTP requests"),
        &["method", "status"]
    )
    .expect("Failed to create HTTP_REQUESTS metric");

    /// Storage operation counter by provider, operation and status
    pub static ref STORAGE_OPERATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("hybridstore_storage_operations_total", "Total storage operations"),
        &["provider", "operation", "status"]
    )
    .expect("Failed to create STORAGE_OPERATIONS metric");

    /// Health probe counter by target and result
    pub static ref PROBE_RESULTS: IntCounterVec = IntCounterVec::new(
        Opts::new("hybridstore_probes_total", "Total health probes"),
        &["target", "result"]
    )
    .expect("Failed to create PROBE_RESULTS metric");

    /// Health probe latency histogram
    pub static ref PROBE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "hybridstore_probe_duration_seconds",
            "Health probe duration in seconds"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    )
    .expect("Failed to create PROBE_DURATION metric");

    /// Active database switches by target role
    pub static ref DATABASE_SWITCHES: IntCounterVec = IntCounterVec::new(
        Opts::new("hybridstore_database_switches_total", "Total active database switches"),
        &["target"]
    )
    .expect("Failed to create DATABASE_SWITCHES metric");

    /// Migrated files by outcome
    pub static ref MIGRATION_FILES: IntCounterVec = IntCounterVec::new(
        Opts::new("hybridstore_migration_files_total", "Files processed by migrations"),
        &["outcome"]
    )
    .expect("Failed to create MIGRATION_FILES metric");
}

/// Register all metrics with the global registry
pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(HTTP_REQUESTS.clone()))?;
    REGISTRY.register(Box::new(STORAGE_OPERATIONS.clone()))?;
    REGISTRY.register(Box::new(PROBE_RESULTS.clone()))?;
    REGISTRY.register(Box::new(PROBE_DURATION.clone()))?;
    REGISTRY.register(Box::new(DATABASE_SWITCHES.clone()))?;
    REGISTRY.register(Box::new(MIGRATION_FILES.clone()))?;
    Ok(())
}

/// Count one storage operation
pub fn record_storage_operation(provider: &str, operation: &str, success: bool) {
    STORAGE_OPERATIONS
        .with_label_values(&[provider, operation, if success { "ok" } else { "error" }])
        .inc();
}
