//! Server configuration loading from file and environment variables.

use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use factlog_db::{DbRuntimeSettings, SyncMode};
use factlog_subscribe::CoordinatorSettings;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Subscription engine settings.
    #[serde(default)]
    pub subscription: SubscriptionConfig,

    /// State token retention.
    #[serde(default)]
    pub state_tokens: StateTokenConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// SQLite `synchronous` level: "off", "normal" or "full".
    #[serde(default, deserialize_with = "deserialize_sync_mode")]
    pub synchronous: SyncMode,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "factlog_subscribe=trace,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Subscription engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    /// Debounce window for follow queries when a request sets none.
    #[serde(default = "default_max_follow_delay_ms")]
    pub max_follow_delay_ms: u64,

    /// Subscriptions allowed to connect at the same time.
    #[serde(default = "default_max_concurrent_catchups")]
    pub max_concurrent_catchups: usize,

    /// How often the fast-forward target is re-read. `0` disables the
    /// refresh task; every connect then reads the head itself.
    #[serde(default = "default_fast_forward_refresh_secs")]
    pub fast_forward_refresh_secs: u64,

    /// Facts never delivered to any subscriber.
    #[serde(default)]
    pub blocked_fact_ids: Vec<Uuid>,
}

/// State token retention configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StateTokenConfig {
    /// Tokens older than this are deleted.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Seconds between compaction runs. `0` disables compaction.
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "factlog.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn deserialize_sync_mode<'de, D>(deserializer: D) -> Result<SyncMode, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_follow_delay_ms() -> u64 {
    100
}

fn default_max_concurrent_catchups() -> usize {
    8
}

fn default_fast_forward_refresh_secs() -> u64 {
    60
}

fn default_retention_days() -> u32 {
    30
}

fn default_compaction_interval_secs() -> u64 {
    3_600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            synchronous: SyncMode::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_follow_delay_ms: default_max_follow_delay_ms(),
            max_concurrent_catchups: default_max_concurrent_catchups(),
            fast_forward_refresh_secs: default_fast_forward_refresh_secs(),
            blocked_fact_ids: Vec::new(),
        }
    }
}

impl Default for StateTokenConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            compaction_interval_secs: default_compaction_interval_secs(),
        }
    }
}

impl DatabaseConfig {
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
            synchronous: self.synchronous,
        }
    }
}

impl SubscriptionConfig {
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            default_max_follow_delay: Duration::from_millis(self.max_follow_delay_ms),
            max_concurrent_catchups: self.max_concurrent_catchups,
            blocked_fact_ids: self.blocked_fact_ids.iter().copied().collect::<HashSet<_>>(),
            // With the refresh task off nothing else moves the target.
            fast_forward_max_age: Duration::from_secs(self.fast_forward_refresh_secs),
        }
    }
}

impl StateTokenConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `FACTLOG_HOST` overrides `server.host`
/// - `FACTLOG_PORT` overrides `server.port`
/// - `FACTLOG_DB_PATH` overrides `database.path`
/// - `FACTLOG_DB_SYNCHRONOUS` overrides `database.synchronous`
/// - `FACTLOG_LOG_LEVEL` overrides `logging.level`
/// - `FACTLOG_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `FACTLOG_MAX_FOLLOW_DELAY_MS` overrides `subscription.max_follow_delay_ms`
/// - `FACTLOG_TOKEN_RETENTION_DAYS` overrides `state_tokens.retention_days`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("FACTLOG_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("FACTLOG_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = var("FACTLOG_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(mode) = var("FACTLOG_DB_SYNCHRONOUS") {
        if let Ok(parsed) = mode.parse() {
            config.database.synchronous = parsed;
        }
    }
    if let Some(level) = var("FACTLOG_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("FACTLOG_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(delay) = var("FACTLOG_MAX_FOLLOW_DELAY_MS") {
        if let Ok(parsed) = delay.parse() {
            config.subscription.max_follow_delay_ms = parsed;
        }
    }
    if let Some(days) = var("FACTLOG_TOKEN_RETENTION_DAYS") {
        if let Ok(parsed) = days.parse() {
            config.state_tokens.retention_days = parsed;
        }
    }
}
