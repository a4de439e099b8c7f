//! Database Failover Controller
//!
//! Holds which database (primary or backup) is designated active and makes
//! operator-triggered switches safe: the target is re-probed, uncached,
//! immediately before the pointer is written. The controller never switches
//! on its own. `none` is only ever a read-time observation when both
//! databases fail their probes; it is never stored.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::database::{DatabaseAdapter, DatabaseRole, InitError, InitOutcome, Schema};
use crate::errors::{BackendError, Classify, ErrorKind};
use crate::health::{HealthMonitor, ProbeTarget};
use crate::metrics::DATABASE_SWITCHES;

/// Which database currently serves reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveDatabase {
    Primary,
    Backup,
    None,
}

impl From<DatabaseRole> for ActiveDatabase {
    fn from(role: DatabaseRole) -> Self {
        match role {
            DatabaseRole::Primary => ActiveDatabase::Primary,
            DatabaseRole::Backup => ActiveDatabase::Backup,
        }
    }
}

/// Aggregate database health
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseHealth {
    pub primary: bool,
    pub backup: bool,
    pub active: ActiveDatabase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SwitchError {
    #[error("cannot switch to {role} database: {detail}")]
    TargetUnavailable { role: DatabaseRole, detail: String },
}

impl Classify for SwitchError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::PreconditionFailed
    }

    fn backend(&self) -> Option<String> {
        match self {
            SwitchError::TargetUnavailable { role, .. } => Some(role.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("primary database unavailable: {detail}")]
    SourceUnavailable { detail: String },

    #[error("backup database unavailable: {detail}")]
    TargetUnavailable { detail: String },

    #[error("a primary-to-backup sync is already running")]
    AlreadyRunning,
}

impl Classify for SyncError {
    fn kind(&self) -> ErrorKind {
        match self {
            SyncError::SourceUnavailable { .. } | SyncError::TargetUnavailable { .. } => ErrorKind::PreconditionFailed,
            SyncError::AlreadyRunning => ErrorKind::AlreadyInProgress,
        }
    }

    fn backend(&self) -> Option<String> {
        match self {
            SyncError::SourceUnavailable { .. } => Some(DatabaseRole::Primary.to_string()),
            SyncError::TargetUnavailable { .. } => Some(DatabaseRole::Backup.to_string()),
            SyncError::AlreadyRunning => None,
        }
    }
}

/// Errors of queries forwarded to the active database
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("no database is active")]
    NoActiveDatabase,

    #[error("{role} database query failed: {source}")]
    Backend { role: DatabaseRole, source: BackendError },
}

impl Classify for QueryError {
    fn kind(&self) -> ErrorKind {
        match self {
            QueryError::NoActiveDatabase => ErrorKind::Unhealthy,
            QueryError::Backend { source, .. } => source.kind(),
        }
    }

    fn backend(&self) -> Option<String> {
        match self {
            QueryError::NoActiveDatabase => None,
            QueryError::Backend { role, .. } => Some(role.to_string()),
        }
    }
}

/// Per-table outcome of a sync
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSync {
    pub table: String,
    pub rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a primary-to-backup sync
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub tables: Vec<TableSync>,
    pub rows_copied: u64,
    pub failed_tables: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncSummary {
    pub fn is_complete(&self) -> bool {
        self.failed_tables == 0
    }
}

/// Clears the running flag when a sync ends, however it ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Database failover controller
pub struct FailoverController {
    primary: DatabaseAdapter,
    backup: DatabaseAdapter,
    monitor: Arc<HealthMonitor>,
    schema: Schema,
    sync_tables: Vec<String>,
    /// Designated active database; `None` before the first healthy probe
    /// and after a total outage
    active: RwLock<Option<DatabaseRole>>,
    /// Serializes switches; held across the verification probe
    switch_lock: Mutex<()>,
    sync_running: AtomicBool,
}

impl FailoverController {
    /// Create a controller; `sync_tables` defaults to every schema table when empty
    pub fn new(
        primary: DatabaseAdapter,
        backup: DatabaseAdapter,
        monitor: Arc<HealthMonitor>,
        schema: Schema,
        sync_tables: Vec<String>,
    ) -> Self {
        let sync_tables = if sync_tables.is_empty() {
            schema.table_names()
        } else {
            sync_tables
        };
        Self {
            primary,
            backup,
            monitor,
            schema,
            sync_tables,
            active: RwLock::new(None),
            switch_lock: Mutex::new(()),
            sync_running: AtomicBool::new(false),
        }
    }

    fn adapter(&self, role: DatabaseRole) -> &DatabaseAdapter {
        match role {
            DatabaseRole::Primary => &self.primary,
            DatabaseRole::Backup => &self.backup,
        }
    }

    /// Probe both databases and report which one is active
    pub async fn health(&self) -> DatabaseHealth {
        let (primary, backup) = tokio::join!(
            self.monitor.probe(ProbeTarget::Database(DatabaseRole::Primary)),
            self.monitor.probe(ProbeTarget::Database(DatabaseRole::Backup)),
        );

        let active = if !primary.healthy && !backup.healthy {
            self.release_after_outage().await
        } else {
            let current = *self.active.read().await;
            match current {
                Some(role) => role.into(),
                None => self.designate_initial(primary.healthy).await,
            }
        };

        DatabaseHealth {
            primary: primary.healthy,
            backup: backup.healthy,
            active,
            primary_detail: primary.detail,
            backup_detail: backup.detail,
            checked_at: Utc::now(),
        }
    }

    /// Drop the designation once fresh probes confirm both databases are
    /// down, so the next healthy probe designates again
    async fn release_after_outage(&self) -> ActiveDatabase {
        let _switch = self.switch_lock.lock().await;
        let (primary, backup) = tokio::join!(
            self.monitor.probe_fresh(ProbeTarget::Database(DatabaseRole::Primary)),
            self.monitor.probe_fresh(ProbeTarget::Database(DatabaseRole::Backup)),
        );
        if primary.healthy || backup.healthy {
            return match *self.active.read().await {
                Some(role) => role.into(),
                None => ActiveDatabase::None,
            };
        }

        if let Some(role) = self.active.write().await.take() {
            warn!(role = %role, "Both databases unreachable, releasing active designation");
        }
        ActiveDatabase::None
    }

    /// First designation after startup or a total outage: primary when
    /// healthy, otherwise backup, verified with a fresh probe
    async fn designate_initial(&self, primary_healthy: bool) -> ActiveDatabase {
        let _switch = self.switch_lock.lock().await;
        if let Some(role) = *self.active.read().await {
            return role.into();
        }

        let candidates = if primary_healthy {
            [DatabaseRole::Primary, DatabaseRole::Backup]
        } else {
            [DatabaseRole::Backup, DatabaseRole::Primary]
        };
        for role in candidates {
            if self.monitor.probe_fresh(ProbeTarget::Database(role)).await.healthy {
                *self.active.write().await = Some(role);
                info!(role = %role, "Designated active database");
                return role.into();
            }
        }
        ActiveDatabase::None
    }

    /// Designated active database without probing
    pub async fn active_role(&self) -> Option<DatabaseRole> {
        *self.active.read().await
    }

    /// Make `target` the active database
    ///
    /// Fails with `SwitchError::TargetUnavailable` and leaves the active
    /// database unchanged when a fresh probe of `target` fails. Switching to
    /// the database that is already active succeeds without changes.
    pub async fn switch_to(&self, target: DatabaseRole) -> Result<(), SwitchError> {
        let _switch = self.switch_lock.lock().await;

        let probe = self.monitor.probe_fresh(ProbeTarget::Database(target)).await;
        if !probe.healthy {
            let detail = probe.detail.unwrap_or_else(|| "unhealthy".to_string());
            warn!(role = %target, detail = %detail, "Refusing database switch to unhealthy target");
            return Err(SwitchError::TargetUnavailable { role: target, detail });
        }

        let previous = self.active.write().await.replace(target);
        if previous == Some(target) {
            debug!(role = %target, "Database already active");
        } else {
            DATABASE_SWITCHES.with_label_values(&[target.as_str()]).inc();
            info!(from = ?previous, to = %target, "Switched active database");
        }
        Ok(())
    }

    /// Create missing tables on the backup database
    pub async fn initialize_backup(&self) -> Result<InitOutcome, InitError> {
        self.backup.initialize(&self.schema).await
    }

    /// Copy every synced table from primary to backup, overwriting backup
    ///
    /// Tables are copied independently; a failing table is reported in the
    /// summary and does not stop the others.
    pub async fn sync_primary_to_backup(&self) -> Result<SyncSummary, SyncError> {
        if self.sync_running.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.sync_running);

        let (primary, backup) = tokio::join!(
            self.monitor.probe_fresh(ProbeTarget::Database(DatabaseRole::Primary)),
            self.monitor.probe_fresh(ProbeTarget::Database(DatabaseRole::Backup)),
        );
        if !primary.healthy {
            return Err(SyncError::SourceUnavailable {
                detail: primary.detail.unwrap_or_default(),
            });
        }
        if !backup.healthy {
            return Err(SyncError::TargetUnavailable {
                detail: backup.detail.unwrap_or_default(),
            });
        }

        let started_at = Utc::now();
        info!(tables = self.sync_tables.len(), "Starting primary-to-backup sync");

        let mut tables = Vec::with_capacity(self.sync_tables.len());
        for table in &self.sync_tables {
            let outcome = match self.primary.export_table(table).await {
                Ok(rows) => self.backup.replace_table(table, &rows).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(rows) => {
                    debug!(table = %table, rows, "Table synced");
                    tables.push(TableSync {
                        table: table.clone(),
                        rows,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(table = %table, error = %e, "Table sync failed");
                    tables.push(TableSync {
                        table: table.clone(),
                        rows: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let summary = SyncSummary {
            rows_copied: tables.iter().map(|t| t.rows).sum(),
            failed_tables: tables.iter().filter(|t| t.error.is_some()).count(),
            tables,
            started_at,
            finished_at: Utc::now(),
        };
        if summary.is_complete() {
            info!(rows = summary.rows_copied, "Primary-to-backup sync finished");
        } else {
            warn!(
                rows = summary.rows_copied,
                failed_tables = summary.failed_tables,
                "Primary-to-backup sync finished with failed tables"
            );
        }
        Ok(summary)
    }

    fn active_adapter(&self, role: Option<DatabaseRole>) -> Result<&DatabaseAdapter, QueryError> {
        role.map(|r| self.adapter(r)).ok_or(QueryError::NoActiveDatabase)
    }

    /// Run a statement on the active database
    pub async fn execute(&self, query: &str) -> Result<u64, QueryError> {
        let adapter = self.active_adapter(self.active_role().await)?;
        adapter.execute(query).await.map_err(|source| QueryError::Backend {
            role: adapter.role(),
            source,
        })
    }

    /// Run a query on the active database, rows as JSON objects
    pub async fn fetch_json(&self, query: &str) -> Result<Vec<Value>, QueryError> {
        let adapter = self.active_adapter(self.active_role().await)?;
        adapter.fetch_json(query).await.map_err(|source| QueryError::Backend {
            role: adapter.role(),
            source,
        })
    }
}
