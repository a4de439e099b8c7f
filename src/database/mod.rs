//! Database adapters for the primary and backup targets
//!
//! `DatabaseEngine` is the seam to a physical database; `PgDatabase` is the
//! PostgreSQL implementation. `DatabaseAdapter` wraps an engine with bounded
//! timeouts, health reporting through the monitor, and idempotent schema
//! initialization for the backup target.

mod postgres;
mod schema;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::errors::{with_timeout, BackendError, Classify, ErrorKind};
use crate::health::{HealthMonitor, ProbeTarget};

pub use postgres::PgDatabase;
pub use schema::{is_valid_identifier, Schema, TableDefinition};

/// Which of the two databases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseRole {
    Primary,
    Backup,
}

impl DatabaseRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseRole::Primary => "primary",
            DatabaseRole::Backup => "backup",
        }
    }
}

impl fmt::Display for DatabaseRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "primary" => Ok(DatabaseRole::Primary),
            "backup" => Ok(DatabaseRole::Backup),
            _ => Err(format!("Unknown database role: {}", s)),
        }
    }
}

/// Schema initialization errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InitError {
    /// Target could not be reached; nothing was applied
    #[error("{role} database unavailable: {source}")]
    Unavailable { role: DatabaseRole, source: BackendError },

    /// A statement failed and the transaction was rolled back
    #[error("{role} schema initialization failed and was rolled back: {source}")]
    RolledBack { role: DatabaseRole, source: BackendError },

    /// Some statements were applied and could not be undone
    #[error("{role} schema partially applied ({applied} of {total} statements): {source}")]
    PartiallyApplied {
        role: DatabaseRole,
        applied: usize,
        total: usize,
        source: BackendError,
    },
}

impl Classify for InitError {
    fn kind(&self) -> ErrorKind {
        match self {
            InitError::Unavailable { source, .. } => source.kind(),
            InitError::RolledBack { .. } => ErrorKind::Unhealthy,
            InitError::PartiallyApplied { .. } => ErrorKind::PartialFailure,
        }
    }

    fn backend(&self) -> Option<String> {
        let role = match self {
            InitError::Unavailable { role, .. }
            | InitError::RolledBack { role, .. }
            | InitError::PartiallyApplied { role, .. } => role,
        };
        Some(role.to_string())
    }
}

/// Result of a successful initialization
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum InitOutcome {
    /// Missing tables were created
    #[serde(rename_all = "camelCase")]
    Created { created_tables: Vec<String> },
    /// Every table already existed; nothing was changed
    AlreadyInitialized,
}

/// A physical database
#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    fn role(&self) -> DatabaseRole;

    /// Trivial round trip used by health probes
    async fn ping(&self) -> Result<(), BackendError>;

    /// Tables of `schema` that do not exist yet
    async fn missing_tables(&self, schema: &Schema) -> Result<Vec<String>, BackendError>;

    /// Create the given tables of `schema` atomically
    async fn apply_schema(&self, schema: &Schema, tables: &[String]) -> Result<(), InitError>;

    /// Run a statement verbatim, returning affected rows
    async fn execute(&self, query: &str) -> Result<u64, BackendError>;

    /// Run a query verbatim, returning each row as a JSON object
    async fn fetch_json(&self, query: &str) -> Result<Vec<Value>, BackendError>;

    /// Every row of a table as JSON objects
    async fn export_table(&self, table: &str) -> Result<Vec<Value>, BackendError>;

    /// Replace the content of a table with `rows` in one transaction
    async fn replace_table(&self, table: &str, rows: &[Value]) -> Result<u64, BackendError>;
}

/// One database target with bounded calls
pub struct DatabaseAdapter {
    engine: Arc<dyn DatabaseEngine>,
    monitor: Arc<HealthMonitor>,
    timeout: Duration,
}

impl DatabaseAdapter {
    pub fn new(engine: Arc<dyn DatabaseEngine>, monitor: Arc<HealthMonitor>, timeout: Duration) -> Self {
        Self {
            engine,
            monitor,
            timeout,
        }
    }

    pub fn role(&self) -> DatabaseRole {
        self.engine.role()
    }

    /// Health as reported by the monitor
    pub async fn is_healthy(&self) -> bool {
        self.monitor.probe(ProbeTarget::Database(self.role())).await.healthy
    }

    /// Create any missing schema tables
    ///
    /// Idempotent: when every table exists this is a successful no-op.
    pub async fn initialize(&self, schema: &Schema) -> Result<InitOutcome, InitError> {
        let role = self.role();
        let missing = with_timeout(self.timeout, self.engine.missing_tables(schema))
            .await
            .map_err(|source| InitError::Unavailable { role, source })?;

        if missing.is_empty() {
            info!(role = %role, "Database schema already initialized");
            return Ok(InitOutcome::AlreadyInitialized);
        }

        match tokio::time::timeout(self.timeout, self.engine.apply_schema(schema, &missing)).await {
            Ok(Ok(())) => {
                info!(role = %role, tables = ?missing, "Database schema initialized");
                Ok(InitOutcome::Created {
                    created_tables: missing,
                })
            }
            Ok(Err(e)) => {
                warn!(role = %role, error = %e, "Database schema initialization failed");
                Err(e)
            }
            // The transaction is dropped with the future and rolled back by the server.
            Err(_) => Err(InitError::RolledBack {
                role,
                source: BackendError::Timeout(self.timeout),
            }),
        }
    }

    pub async fn execute(&self, query: &str) -> Result<u64, BackendError> {
        with_timeout(self.timeout, self.engine.execute(query)).await
    }

    pub async fn fetch_json(&self, query: &str) -> Result<Vec<Value>, BackendError> {
        with_timeout(self.timeout, self.engine.fetch_json(query)).await
    }

    pub(crate) async fn export_table(&self, table: &str) -> Result<Vec<Value>, BackendError> {
        with_timeout(self.timeout, self.engine.export_table(table)).await
    }

    pub(crate) async fn replace_table(&self, table: &str, rows: &[Value]) -> Result<u64, BackendError> {
        with_timeout(self.timeout, self.engine.replace_table(table, rows)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::testing::FakeDatabase;

    fn adapter(engine: Arc<FakeDatabase>) -> DatabaseAdapter {
        let monitor = Arc::new(HealthMonitor::new(&HealthConfig::default()).with_database(engine.clone()));
        DatabaseAdapter::new(engine, monitor, Duration::from_millis(200))
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!(DatabaseRole::from_str("Backup").unwrap(), DatabaseRole::Backup);
        assert!(DatabaseRole::from_str("replica").is_err());
        assert_eq!(serde_json::to_string(&DatabaseRole::Primary).unwrap(), "\"primary\"");
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let engine = FakeDatabase::new(DatabaseRole::Backup);
        let adapter = adapter(engine.clone());
        let schema = Schema::default();

        let first = adapter.initialize(&schema).await.unwrap();
        assert!(matches!(first, InitOutcome::Created { ref created_tables } if created_tables.len() == schema.tables.len()));
        let healthy_after_first = adapter.is_healthy().await;

        let second = adapter.initialize(&schema).await.unwrap();
        assert_eq!(second, InitOutcome::AlreadyInitialized);
        assert_eq!(adapter.is_healthy().await, healthy_after_first);
        assert_eq!(engine.schema_applications(), 1);
    }

    #[tokio::test]
    async fn test_initialize_unreachable_applies_nothing() {
        let engine = FakeDatabase::new(DatabaseRole::Backup);
        engine.set_unreachable(true);
        let adapter = adapter(engine.clone());

        let err = adapter.initialize(&Schema::default()).await.unwrap_err();
        assert!(matches!(err, InitError::Unavailable { role: DatabaseRole::Backup, .. }));
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert_eq!(engine.schema_applications(), 0);
        assert!(engine.table_names().is_empty());
    }

    #[tokio::test]
    async fn test_partial_schema_failure_is_surfaced() {
        let engine = FakeDatabase::new(DatabaseRole::Backup);
        engine.fail_schema_after(2);
        let adapter = adapter(engine.clone());

        let err = adapter.initialize(&Schema::default()).await.unwrap_err();
        assert!(matches!(err, InitError::PartiallyApplied { applied: 2, .. }));
        assert_eq!(err.kind(), ErrorKind::PartialFailure);
        assert_eq!(err.backend().as_deref(), Some("backup"));
    }

    #[tokio::test]
    async fn test_execute_is_bounded() {
        let engine = FakeDatabase::new(DatabaseRole::Primary);
        engine.set_hanging(true);
        let adapter = adapter(engine);

        let err = adapter.execute("UPDATE projects SET archived = true").await.unwrap_err();
        assert_eq!(err, BackendError::Timeout(Duration::from_millis(200)));
    }
}
