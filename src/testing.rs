//! In-memory fakes shared by the unit tests

use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::database::{DatabaseEngine, DatabaseRole, InitError, Schema};
use crate::errors::BackendError;
use crate::migration::{MigrationStatus, MigrationTracker};
use crate::storage::object::PrefixedStore;
use crate::storage::{ObjectInfo, ProviderName, StorageBackend};

/// Storage provider over `InMemory` with failure injection
pub struct FakeBackend {
    name: ProviderName,
    store: PrefixedStore,
    unreachable: AtomicBool,
    failing_puts: Mutex<HashMap<String, u32>>,
    down_after_puts: Mutex<Option<usize>>,
    latency: Mutex<Duration>,
    puts: AtomicUsize,
}

impl FakeBackend {
    pub fn new(name: ProviderName) -> Arc<Self> {
        Arc::new(Self {
            name,
            store: PrefixedStore::new(Arc::new(InMemory::new()), None),
            unreachable: AtomicBool::new(false),
            failing_puts: Mutex::new(HashMap::new()),
            down_after_puts: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
            puts: AtomicUsize::new(0),
        })
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make the next `times` writes of `path` fail with a transient error
    pub fn fail_puts(&self, path: &str, times: u32) {
        self.failing_puts.lock().unwrap().insert(path.to_string(), times);
    }

    /// Become unreachable once `puts` write attempts have been made
    pub fn go_down_after_puts(&self, puts: usize) {
        *self.down_after_puts.lock().unwrap() = Some(puts);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Successful and failed write attempts
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Write directly, bypassing injected failures
    pub async fn seed(&self, path: &str, data: &'static [u8]) {
        self.store.put(path, Bytes::from_static(data)).await.unwrap();
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.store.head(path).await.is_ok()
    }

    async fn gate(&self) -> Result<(), BackendError> {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            Err(BackendError::Unreachable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageBackend for FakeBackend {
    fn name(&self) -> ProviderName {
        self.name
    }

    async fn get(&self, path: &str) -> Result<Bytes, BackendError> {
        self.gate().await?;
        self.store.get(path).await
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<(), BackendError> {
        let attempts = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        if matches!(*self.down_after_puts.lock().unwrap(), Some(limit) if attempts > limit) {
            self.set_unreachable(true);
        }
        self.gate().await?;
        {
            let mut failing = self.failing_puts.lock().unwrap();
            if let Some(remaining) = failing.get_mut(path) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BackendError::Other(format!("transient write error on {}", path)));
                }
            }
        }
        self.store.put(path, data).await
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        self.gate().await?;
        self.store.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, BackendError> {
        self.gate().await?;
        self.store.list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<ObjectInfo, BackendError> {
        self.gate().await?;
        self.store.head(path).await
    }

    async fn check(&self) -> Result<(), BackendError> {
        self.gate().await
    }

    fn url(&self, path: &str) -> String {
        format!("fake://{}/{}", self.name, path)
    }
}

/// Database with in-memory tables and switchable failure modes
pub struct FakeDatabase {
    role: DatabaseRole,
    unreachable: AtomicBool,
    unauthorized: AtomicBool,
    hanging: AtomicBool,
    tables: Mutex<BTreeMap<String, Vec<Value>>>,
    schema_applications: AtomicUsize,
    fail_schema_after: Mutex<Option<usize>>,
    failing_tables: Mutex<HashSet<String>>,
}

impl FakeDatabase {
    pub fn new(role: DatabaseRole) -> Arc<Self> {
        Arc::new(Self {
            role,
            unreachable: AtomicBool::new(false),
            unauthorized: AtomicBool::new(false),
            hanging: AtomicBool::new(false),
            tables: Mutex::new(BTreeMap::new()),
            schema_applications: AtomicUsize::new(0),
            fail_schema_after: Mutex::new(None),
            failing_tables: Mutex::new(HashSet::new()),
        })
    }

    pub fn set_unreachable(&self, value: bool) {
        self.unreachable.store(value, Ordering::SeqCst);
    }

    pub fn set_unauthorized(&self, value: bool) {
        self.unauthorized.store(value, Ordering::SeqCst);
    }

    pub fn set_hanging(&self, value: bool) {
        self.hanging.store(value, Ordering::SeqCst);
    }

    /// Apply only the first `applied` tables, then fail without undoing them
    pub fn fail_schema_after(&self, applied: usize) {
        *self.fail_schema_after.lock().unwrap() = Some(applied);
    }

    pub fn fail_replace(&self, table: &str) {
        self.failing_tables.lock().unwrap().insert(table.to_string());
    }

    pub fn insert_rows(&self, table: &str, rows: Vec<Value>) {
        self.tables.lock().unwrap().insert(table.to_string(), rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables.lock().unwrap().get(table).cloned().unwrap_or_default()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.lock().unwrap().keys().cloned().collect()
    }

    pub fn schema_applications(&self) -> usize {
        self.schema_applications.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> Result<(), BackendError> {
        if self.hanging.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::Unreachable("connection refused".to_string()));
        }
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(BackendError::Unauthorized("password authentication failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseEngine for FakeDatabase {
    fn role(&self) -> DatabaseRole {
        self.role
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.gate().await
    }

    async fn missing_tables(&self, schema: &Schema) -> Result<Vec<String>, BackendError> {
        self.gate().await?;
        let tables = self.tables.lock().unwrap();
        Ok(schema
            .table_names()
            .into_iter()
            .filter(|name| !tables.contains_key(name))
            .collect())
    }

    async fn apply_schema(&self, _schema: &Schema, tables: &[String]) -> Result<(), InitError> {
        let role = self.role;
        self.gate()
            .await
            .map_err(|source| InitError::Unavailable { role, source })?;
        self.schema_applications.fetch_add(1, Ordering::SeqCst);

        let fail_after = *self.fail_schema_after.lock().unwrap();
        let mut existing = self.tables.lock().unwrap();
        for (applied, name) in tables.iter().enumerate() {
            if fail_after == Some(applied) {
                return Err(InitError::PartiallyApplied {
                    role,
                    applied,
                    total: tables.len(),
                    source: BackendError::Other("disk full".to_string()),
                });
            }
            existing.insert(name.clone(), Vec::new());
        }
        Ok(())
    }

    async fn execute(&self, _query: &str) -> Result<u64, BackendError> {
        self.gate().await?;
        Ok(0)
    }

    async fn fetch_json(&self, query: &str) -> Result<Vec<Value>, BackendError> {
        self.gate().await?;
        match query.strip_prefix("SELECT * FROM ") {
            Some(table) => Ok(self.rows(table.trim())),
            None => Ok(Vec::new()),
        }
    }

    async fn export_table(&self, table: &str) -> Result<Vec<Value>, BackendError> {
        self.gate().await?;
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .ok_or_else(|| BackendError::Other(format!("relation \"{}\" does not exist", table)))
    }

    async fn replace_table(&self, table: &str, rows: &[Value]) -> Result<u64, BackendError> {
        self.gate().await?;
        if self.failing_tables.lock().unwrap().contains(table) {
            return Err(BackendError::Other(format!("constraint violation in {}", table)));
        }
        let mut tables = self.tables.lock().unwrap();
        match tables.get_mut(table) {
            Some(existing) => {
                *existing = rows.to_vec();
                Ok(rows.len() as u64)
            }
            None => Err(BackendError::Other(format!("relation \"{}\" does not exist", table))),
        }
    }
}

/// Poll until the current migration run has finished
pub async fn wait_for_migration(tracker: &MigrationTracker) -> MigrationStatus {
    for _ in 0..500 {
        let status = tracker.status().await;
        if !status.in_progress {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("migration did not finish in time");
}
