//! Configuration management for hybridstore
//!
//! Supports configuration via:
//! - Environment variables (primary)
//! - Optional TOML config file (secondary)
//!
//! Environment variables take precedence over config file values.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::storage::{ProviderLimits, ProviderName};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0:8080)
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Request timeout in seconds (default: 300)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Max request body size in bytes (default: 64MB)
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            timeout_secs: default_timeout_secs(),
            max_body_size: default_max_body_size(),
        }
    }
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_body_size() -> usize {
    64 * 1024 * 1024 // 64MB
}

/// Health probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Upper bound for a single probe in milliseconds (default: 5000)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// How long a probe result may be reused by status reads; 0 disables
    /// caching (default: 0)
    #[serde(default)]
    pub cache_ttl_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            cache_ttl_secs: 0,
        }
    }
}

impl HealthConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

/// Local filesystem provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory objects are stored under
    pub root: PathBuf,

    #[serde(default)]
    pub prefix: Option<String>,

    #[serde(flatten)]
    pub limits: ProviderLimits,
}

/// cloud-a: S3-compatible provider
#[derive(Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub bucket_name: String,

    /// Region (default: us-east-1)
    #[serde(default = "default_region")]
    pub region: String,

    /// Endpoint URL for S3-compatible services
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub allow_http: bool,

    #[serde(default)]
    pub prefix: Option<String>,

    /// Use the default credential chain instead of explicit keys
    #[serde(default = "default_true")]
    pub use_managed_identity: bool,

    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,

    #[serde(flatten)]
    pub limits: ProviderLimits,
}

impl std::fmt::Debug for AwsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsConfig")
            .field("bucket_name", &self.bucket_name)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("prefix", &self.prefix)
            .field("use_managed_identity", &self.use_managed_identity)
            .finish_non_exhaustive()
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_true() -> bool {
    true
}

/// cloud-b: Google Cloud Storage provider
#[derive(Clone, Serialize, Deserialize)]
pub struct GcpConfig {
    pub bucket_name: String,

    #[serde(default)]
    pub prefix: Option<String>,

    /// Path to a service account JSON key file
    #[serde(default)]
    pub service_account_path: Option<String>,

    /// Service account JSON key as a string
    #[serde(default)]
    pub service_account_key: Option<String>,

    #[serde(flatten)]
    pub limits: ProviderLimits,
}

impl std::fmt::Debug for GcpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpConfig")
            .field("bucket_name", &self.bucket_name)
            .field("prefix", &self.prefix)
            .field("service_account_path", &self.service_account_path)
            .finish_non_exhaustive()
    }
}

/// File storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Provider used when an upload does not name one (default: local)
    #[serde(default = "default_preferred")]
    pub preferred: ProviderName,

    /// Upper bound for a single provider call in seconds (default: 30)
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// JSON file the file catalog is persisted to; in-memory when unset
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,

    /// Objects younger than this are never treated as orphans (default: 3600)
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,

    /// Whether cleanup deletes orphans or only reports them; defaults to
    /// deleting only when the catalog is persisted
    #[serde(default)]
    pub delete_orphans: Option<bool>,

    #[serde(default)]
    pub local: Option<LocalConfig>,

    #[serde(default)]
    pub cloud_a: Option<AwsConfig>,

    #[serde(default)]
    pub cloud_b: Option<GcpConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            preferred: default_preferred(),
            operation_timeout_secs: default_operation_timeout_secs(),
            catalog_path: None,
            orphan_grace_secs: default_orphan_grace_secs(),
            delete_orphans: None,
            local: Some(LocalConfig {
                root: PathBuf::from("./data/files"),
                prefix: None,
                limits: ProviderLimits::default(),
            }),
            cloud_a: None,
            cloud_b: None,
        }
    }
}

impl StorageConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }

    pub fn deletes_orphans(&self) -> bool {
        self.delete_orphans.unwrap_or(self.catalog_path.is_some())
    }
}

fn default_preferred() -> ProviderName {
    ProviderName::Local
}

fn default_operation_timeout_secs() -> u64 {
    30
}

fn default_orphan_grace_secs() -> u64 {
    3600
}

/// Primary/backup database configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub primary_url: Option<String>,

    #[serde(default)]
    pub backup_url: Option<String>,

    /// Pool size per database (default: 5)
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Upper bound for a single query in seconds (default: 10)
    #[serde(default = "default_db_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// Tables copied by primary-to-backup sync; all schema tables when empty
    #[serde(default)]
    pub tables: Vec<String>,

    /// TOML schema definition used to initialize the backup
    #[serde(default)]
    pub schema_file: Option<PathBuf>,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("primary_configured", &self.primary_url.is_some())
            .field("backup_configured", &self.backup_url.is_some())
            .field("max_connections", &self.max_connections)
            .field("operation_timeout_secs", &self.operation_timeout_secs)
            .field("tables", &self.tables)
            .field("schema_file", &self.schema_file)
            .finish()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            primary_url: None,
            backup_url: None,
            max_connections: default_max_connections(),
            operation_timeout_secs: default_db_timeout_secs(),
            tables: Vec::new(),
            schema_file: None,
        }
    }
}

impl DatabaseConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_db_timeout_secs() -> u64 {
    10
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    /// Log level (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            health: HealthConfig::default(),
            storage: StorageConfig::default(),
            database: DatabaseConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - HYBRIDSTORE_CONFIG_FILE: optional path to TOML config file
    /// - HYBRIDSTORE_BIND_ADDRESS: server bind address (default: 0.0.0.0:8080)
    /// - HYBRIDSTORE_TIMEOUT_SECS: request timeout (default: 300)
    /// - HYBRIDSTORE_MAX_BODY_SIZE: max request size in bytes (default: 64MB)
    /// - HYBRIDSTORE_LOG_LEVEL: log level (default: info)
    /// - HYBRIDSTORE_PROBE_TIMEOUT_MS: health probe timeout (default: 5000)
    /// - HYBRIDSTORE_HEALTH_CACHE_TTL_SECS: probe cache lifetime (default: 0)
    /// - HYBRIDSTORE_PREFERRED_PROVIDER: local|cloud-a|cloud-b
    /// - HYBRIDSTORE_CATALOG_PATH: file catalog snapshot path
    /// - HYBRIDSTORE_LOCAL_ROOT: local provider directory
    /// - HYBRIDSTORE_CLOUD_A_BUCKET / _REGION / _ENDPOINT: cloud-a bucket settings
    /// - HYBRIDSTORE_CLOUD_B_BUCKET: cloud-b bucket
    /// - HYBRIDSTORE_PRIMARY_DATABASE_URL / HYBRIDSTORE_BACKUP_DATABASE_URL
    pub fn from_env() -> anyhow::Result<Self> {
        let config_file = std::env::var("HYBRIDSTORE_CONFIG_FILE").ok();
        let mut config = if let Some(path) = &config_file {
            Self::from_file(path)?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path))?;
        let config: Config = toml::from_str(&content).with_context(|| format!("Failed to parse config file {}", path))?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("HYBRIDSTORE_BIND_ADDRESS") {
            self.server.bind_address = addr.parse().context("Invalid HYBRIDSTORE_BIND_ADDRESS")?;
        }

        if let Some(timeout) = lookup("HYBRIDSTORE_TIMEOUT_SECS") {
            self.server.timeout_secs = timeout.parse().context("Invalid HYBRIDSTORE_TIMEOUT_SECS")?;
        }

        if let Some(size) = lookup("HYBRIDSTORE_MAX_BODY_SIZE") {
            self.server.max_body_size = size.parse().context("Invalid HYBRIDSTORE_MAX_BODY_SIZE")?;
        }

        if let Some(level) = lookup("HYBRIDSTORE_LOG_LEVEL") {
            self.log_level = level;
        }

        if let Some(timeout) = lookup("HYBRIDSTORE_PROBE_TIMEOUT_MS") {
            self.health.probe_timeout_ms = timeout.parse().context("Invalid HYBRIDSTORE_PROBE_TIMEOUT_MS")?;
        }

        if let Some(ttl) = lookup("HYBRIDSTORE_HEALTH_CACHE_TTL_SECS") {
            self.health.cache_ttl_secs = ttl.parse().context("Invalid HYBRIDSTORE_HEALTH_CACHE_TTL_SECS")?;
        }

        if let Some(provider) = lookup("HYBRIDSTORE_PREFERRED_PROVIDER") {
            self.storage.preferred = ProviderName::from_str(&provider).map_err(anyhow::Error::msg)?;
        }

        if let Some(path) = lookup("HYBRIDSTORE_CATALOG_PATH") {
            self.storage.catalog_path = Some(PathBuf::from(path));
        }

        if let Some(root) = lookup("HYBRIDSTORE_LOCAL_ROOT") {
            match &mut self.storage.local {
                Some(local) => local.root = PathBuf::from(root),
                None => {
                    self.storage.local = Some(LocalConfig {
                        root: PathBuf::from(root),
                        prefix: None,
                        limits: ProviderLimits::default(),
                    })
                }
            }
        }

        if let Some(bucket) = lookup("HYBRIDSTORE_CLOUD_A_BUCKET") {
            let cloud_a = self.storage.cloud_a.get_or_insert_with(|| AwsConfig {
                bucket_name: String::new(),
                region: default_region(),
                endpoint: None,
                allow_http: false,
                prefix: None,
                use_managed_identity: true,
                access_key_id: None,
                secret_access_key: None,
                limits: ProviderLimits::default(),
            });
            cloud_a.bucket_name = bucket;
        }

        if let Some(cloud_a) = &mut self.storage.cloud_a {
            if let Some(region) = lookup("HYBRIDSTORE_CLOUD_A_REGION") {
                cloud_a.region = region;
            }
            if let Some(endpoint) = lookup("HYBRIDSTORE_CLOUD_A_ENDPOINT") {
                cloud_a.endpoint = Some(endpoint);
            }
        }

        if let Some(bucket) = lookup("HYBRIDSTORE_CLOUD_B_BUCKET") {
            let cloud_b = self.storage.cloud_b.get_or_insert_with(|| GcpConfig {
                bucket_name: String::new(),
                prefix: None,
                service_account_path: None,
                service_account_key: None,
                limits: ProviderLimits::default(),
            });
            cloud_b.bucket_name = bucket;
        }

        if let Some(url) = lookup("HYBRIDSTORE_PRIMARY_DATABASE_URL") {
            self.database.primary_url = Some(url);
        }

        if let Some(url) = lookup("HYBRIDSTORE_BACKUP_DATABASE_URL") {
            self.database.backup_url = Some(url);
        }

        Ok(())
    }
}
