//! PostgreSQL database engine
//!
//! Pools are created lazily so that an unreachable database does not stop
//! the service from starting; the failure shows up in the next probe.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::database::{is_valid_identifier, DatabaseEngine, DatabaseRole, InitError, Schema};
use crate::errors::BackendError;

/// PostgreSQL implementation of [`DatabaseEngine`]
pub struct PgDatabase {
    role: DatabaseRole,
    pool: PgPool,
}

impl PgDatabase {
    /// Create a lazily connecting pool for `url`
    pub fn connect_lazy(
        role: DatabaseRole,
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)?;
        Ok(Self { role, pool })
    }

    fn checked_table(table: &str) -> Result<&str, BackendError> {
        if is_valid_identifier(table) {
            Ok(table)
        } else {
            Err(BackendError::Other(format!("invalid table name: {}", table)))
        }
    }
}

#[async_trait]
impl DatabaseEngine for PgDatabase {
    fn role(&self) -> DatabaseRole {
        self.role
    }

    async fn ping(&self) -> Result<(), BackendError> {
        sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn missing_tables(&self, schema: &Schema) -> Result<Vec<String>, BackendError> {
        let mut missing = Vec::new();
        for table in &schema.tables {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1)",
            )
            .bind(&table.name)
            .fetch_one(&self.pool)
            .await?;
            if !exists {
                missing.push(table.name.clone());
            }
        }
        Ok(missing)
    }

    async fn apply_schema(&self, schema: &Schema, tables: &[String]) -> Result<(), InitError> {
        let role = self.role;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| InitError::Unavailable { role, source: e.into() })?;

        // PostgreSQL DDL is transactional: a failure leaves the target untouched.
        for definition in schema.tables.iter().filter(|t| tables.contains(&t.name)) {
            if let Err(e) = sqlx::query(&definition.create_sql).execute(&mut *tx).await {
                let source = BackendError::from(e);
                return match tx.rollback().await {
                    Ok(()) => Err(InitError::RolledBack { role, source }),
                    Err(_) => Err(InitError::PartiallyApplied {
                        role,
                        applied: 0,
                        total: tables.len(),
                        source,
                    }),
                };
            }
        }

        tx.commit()
            .await
            .map_err(|e| InitError::RolledBack { role, source: e.into() })
    }

    async fn execute(&self, query: &str) -> Result<u64, BackendError> {
        let result = sqlx::query(query).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_json(&self, query: &str) -> Result<Vec<Value>, BackendError> {
        let wrapped = format!(
            "SELECT COALESCE(json_agg(q), '[]'::json)::text FROM ({}) AS q",
            query.trim().trim_end_matches(';')
        );
        let text: String = sqlx::query_scalar(&wrapped).fetch_one(&self.pool).await?;
        serde_json::from_str(&text).map_err(|e| BackendError::Other(format!("invalid JSON from database: {}", e)))
    }

    async fn export_table(&self, table: &str) -> Result<Vec<Value>, BackendError> {
        let table = Self::checked_table(table)?;
        self.fetch_json(&format!("SELECT * FROM {}", table)).await
    }

    async fn replace_table(&self, table: &str, rows: &[Value]) -> Result<u64, BackendError> {
        let table = Self::checked_table(table)?;
        let payload = serde_json::to_string(rows)
            .map_err(|e| BackendError::Other(format!("failed to encode rows: {}", e)))?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {}", table)).execute(&mut *tx).await?;
        let inserted = sqlx::query(&format!(
            "INSERT INTO {table} SELECT * FROM json_populate_recordset(NULL::{table}, $1::json)",
            table = table
        ))
        .bind(payload)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(inserted.rows_affected())
    }
}
