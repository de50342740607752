//! Engine configuration.
//!
//! [`EngineConfig::load`] reads `config/config.toml` (optional) and then
//! environment variables prefixed `SHOPFLOOR`, e.g.
//! `SHOPFLOOR__LOCAL__ADMIN_PASSWORD`. The loaded struct is passed to the
//! executors and services that need it; nothing reads settings globally.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::connection::{build_connection_string, ConnectionError};

const CONFIG_FILE: &str = "config/config.toml";
const ENV_PREFIX: &str = "SHOPFLOOR";

/// Top-level settings, one section per subsystem.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub statistics: StatisticsConfig,
    #[serde(default)]
    pub consistency: ConsistencyConfig,
}

/// Local PostgreSQL server holding the registry and every tenant replica.
#[derive(Clone, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_local_host")]
    pub host: String,
    #[serde(default = "default_local_port")]
    pub port: u16,
    #[serde(default = "default_admin_user")]
    pub admin_user: String,
    #[serde(default)]
    pub admin_password: String,
    /// Database with tenants, work orders, dispatches and reports.
    #[serde(default = "default_registry_database")]
    pub registry_database: String,
    /// Maintenance database used for `CREATE DATABASE` / `DROP DATABASE`.
    #[serde(default = "default_maintenance_database")]
    pub maintenance_database: String,
}

impl LocalConfig {
    /// Connection string for `database` using the admin credentials.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::InvalidDatabaseName` for non-identifier names.
    pub fn connection_string(&self, database: &str) -> Result<String, ConnectionError> {
        build_connection_string(&self.host, self.port, &self.admin_user, &self.admin_password, database)
    }
}

impl std::fmt::Debug for LocalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("admin_user", &self.admin_user)
            .field("admin_password", &"<redacted>")
            .field("registry_database", &self.registry_database)
            .field("maintenance_database", &self.maintenance_database)
            .finish()
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            host: default_local_host(),
            port: default_local_port(),
            admin_user: default_admin_user(),
            admin_password: String::new(),
            registry_database: default_registry_database(),
            maintenance_database: default_maintenance_database(),
        }
    }
}

/// Upstream ERP servers. Host and credentials come from the registry.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_port")]
    pub port: u16,
    #[serde(default = "default_handshake_timeout_seconds")]
    pub handshake_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub trust_cert: bool,
}

impl UpstreamConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            port: default_upstream_port(),
            handshake_timeout_seconds: default_handshake_timeout_seconds(),
            trust_cert: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// JSON file with `{"allowed_tables": [...]}`.
    #[serde(default = "default_tables_config")]
    pub tables_config: PathBuf,
    #[serde(default = "default_scheduler_tick_seconds")]
    pub scheduler_tick_seconds: u64,
    /// Primary-key tuples that replace or extend the built-in registry.
    #[serde(default)]
    pub primary_keys: HashMap<String, Vec<String>>,
}

impl SyncConfig {
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_seconds.max(1))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tables_config: default_tables_config(),
            scheduler_tick_seconds: default_scheduler_tick_seconds(),
            primary_keys: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatisticsConfig {
    /// Operation name whose output closes a dispatch.
    #[serde(default = "default_packaging_operation")]
    pub packaging_operation: String,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl StatisticsConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            packaging_operation: default_packaging_operation(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsistencyConfig {
    /// Order or product values marking R&D samples; such reports are never checked.
    #[serde(default = "default_rd_sample_markers")]
    pub rd_sample_markers: Vec<String>,
    /// Substring of an order number that keeps correctors away from a report.
    #[serde(default = "default_rd_order_fragment")]
    pub rd_order_fragment: String,
    /// Product codes correctors never rewrite.
    #[serde(default = "default_protected_products")]
    pub protected_products: Vec<String>,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            rd_sample_markers: default_rd_sample_markers(),
            rd_order_fragment: default_rd_order_fragment(),
            protected_products: default_protected_products(),
        }
    }
}

fn default_local_host() -> String {
    "localhost".to_string()
}

fn default_local_port() -> u16 {
    5432
}

fn default_admin_user() -> String {
    "postgres".to_string()
}

fn default_registry_database() -> String {
    "mes".to_string()
}

fn default_maintenance_database() -> String {
    "postgres".to_string()
}

fn default_upstream_port() -> u16 {
    1433
}

fn default_handshake_timeout_seconds() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_tables_config() -> PathBuf {
    PathBuf::from("erp_integration/config/tables.json")
}

fn default_scheduler_tick_seconds() -> u64 {
    60
}

fn default_packaging_operation() -> String {
    "出貨包裝".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_rd_sample_markers() -> Vec<String> {
    vec!["RD樣品".to_string()]
}

fn default_rd_order_fragment() -> String {
    "RD".to_string()
}

fn default_protected_products() -> Vec<String> {
    vec!["PFP-CCT".to_string()]
}

impl EngineConfig {
    /// Load from `config/config.toml`, falling back to environment only when
    /// the file exists but cannot be read.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when neither source yields a valid configuration.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(CONFIG_FILE)
    }

    /// Same as [`EngineConfig::load`] with an explicit file path.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when neither source yields a valid configuration.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        let settings = match builder.build() {
            Ok(cfg) => cfg,
            Err(err) => {
                if std::path::Path::new(path).exists() {
                    log::warn!("failed to load {path}, falling back to environment: {err}");
                }
                Config::builder()
                    .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
                    .build()
                    .map_err(|env_err| {
                        ConfigError::Message(format!(
                            "Failed to load configuration from file and env: {err}, then env-only error: {env_err}"
                        ))
                    })?
            }
        };

        settings.try_deserialize::<EngineConfig>().map_err(|e| {
            ConfigError::Message(format!("Engine configuration could not be loaded: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.local.port, 5432);
        assert_eq!(cfg.local.registry_database, "mes");
        assert_eq!(cfg.upstream.handshake_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.sync.tables_config, PathBuf::from("erp_integration/config/tables.json"));
        assert_eq!(cfg.statistics.packaging_operation, "出貨包裝");
        assert_eq!(cfg.consistency.rd_sample_markers, vec!["RD樣品".to_string()]);
    }

    #[test]
    fn test_deserialize_partial_sections() {
        let settings = Config::builder()
            .add_source(config::File::from_str(
                r#"
                [local]
                host = "10.0.0.5"
                admin_password = "secret"

                [sync]
                scheduler_tick_seconds = 15

                [sync.primary_keys]
                stkWareHouse = ["WareID"]
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let cfg: EngineConfig = settings.try_deserialize().unwrap();

        assert_eq!(cfg.local.host, "10.0.0.5");
        assert_eq!(cfg.local.port, 5432);
        assert_eq!(cfg.sync.scheduler_tick(), Duration::from_secs(15));
        // Keys may come back lower-cased; the key registry matches case-insensitively.
        let (_, key) = cfg
            .sync
            .primary_keys
            .iter()
            .find(|(table, _)| table.eq_ignore_ascii_case("stkWareHouse"))
            .unwrap();
        assert_eq!(key, &vec!["WareID".to_string()]);
        assert_eq!(cfg.statistics.lock_timeout(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_debug_redacts_password() {
        let local = LocalConfig {
            admin_password: "hunter2".into(),
            ..LocalConfig::default()
        };
        let shown = format!("{local:?}");
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("<redacted>"));
    }

    #[test]
    fn test_local_connection_string() {
        let local = LocalConfig::default();
        let s = local.connection_string("erp_10").unwrap();
        assert!(s.contains("dbname=erp_10"));
        assert!(local.connection_string("erp 10").is_err());
    }
}
