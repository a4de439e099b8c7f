//! Schema applied to the backup database by `initialize`
//!
//! Business entities are stored as JSON documents; the coordinator does not
//! interpret their content, it only needs the tables to exist so that a
//! primary-to-backup sync has somewhere to write.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// One table and the statement that creates it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub create_sql: String,
}

/// Ordered table definitions; creation follows declaration order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub tables: Vec<TableDefinition>,
}

const DOCUMENT_TABLES: [&str; 5] = ["users", "projects", "transactions", "employees", "documents"];

fn document_table(name: &str) -> TableDefinition {
    TableDefinition {
        name: name.to_string(),
        create_sql: format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                id UUID PRIMARY KEY, \
                data JSONB NOT NULL DEFAULT '{{}}'::jsonb, \
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()\
            )",
            name
        ),
    }
}

impl Default for Schema {
    fn default() -> Self {
        let mut tables: Vec<TableDefinition> = DOCUMENT_TABLES.iter().map(|name| document_table(name)).collect();
        tables.push(TableDefinition {
            name: "stored_files".to_string(),
            create_sql: "CREATE TABLE IF NOT EXISTS stored_files (\
                path TEXT PRIMARY KEY, \
                provider TEXT NOT NULL, \
                size_bytes BIGINT NOT NULL, \
                mime_type TEXT NOT NULL, \
                uploaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()\
            )"
            .to_string(),
        });
        Self { tables }
    }
}

impl Schema {
    /// Load a schema from a TOML file of `[[tables]]` entries
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let schema: Schema = toml::from_str(&content)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tables.is_empty() {
            anyhow::bail!("schema defines no tables");
        }
        for table in &self.tables {
            if !is_valid_identifier(&table.name) {
                anyhow::bail!("invalid table name: {}", table.name);
            }
        }
        Ok(())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Plain lowercase SQL identifier; table names are interpolated into SQL
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
