//! LeadCadence Configuration System
//!
//! This crate provides TOML-based process configuration with environment
//! variable override support. Runtime-editable behaviour (sequence, business
//! hours, retry budgets, gateway credentials) lives in the `settings`
//! database singleton, not here.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub postgres: PostgresConfig,
    pub redis: RedisConfig,
    pub gateway: GatewayConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub ingest: IngestConfig,

    /// Enable development mode (in-memory store/queue/lock backends)
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            postgres: PostgresConfig::default(),
            redis: RedisConfig::default(),
            gateway: GatewayConfig::default(),
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            ingest: IngestConfig::default(),
            dev_mode: false,
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// PostgreSQL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/leadcadence".to_string(),
            max_connections: 10,
        }
    }
}

/// Redis (coordination store) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Key prefix for locks and caches
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "lc".to_string(),
        }
    }
}

/// Email gateway client configuration. Credentials come from settings; this
/// covers transport-level knobs and the URL override used in testing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Credential cache TTL in seconds
    pub credential_cache_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.brevo.com/v3".to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            credential_cache_secs: 60,
        }
    }
}

/// Delayed queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Visibility timeout for polled jobs in seconds
    pub visibility_timeout_secs: u64,
    /// Receives before a job is routed to the failed bucket
    pub max_receives: u32,
    /// Poll interval for idle workers in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 120,
            max_receives: 5,
            poll_interval_ms: 250,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Distributed lock TTL in seconds
    pub lock_ttl_secs: u64,
    /// Lock acquisition retries
    pub lock_max_retries: u32,
    /// Base backoff between lock retries in milliseconds
    pub lock_base_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 30,
            lock_max_retries: 3,
            lock_base_backoff_ms: 50,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub send_concurrency: u32,
    pub send_rate_per_second: u32,
    pub followup_concurrency: u32,
    pub followup_rate_per_second: u32,
    pub analytics_concurrency: u32,
    pub analytics_rate_per_second: u32,
    /// Jobs stuck in `sending` beyond this are recovered, in minutes
    pub stale_send_threshold_mins: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            send_concurrency: 5,
            send_rate_per_second: 10,
            followup_concurrency: 3,
            followup_rate_per_second: 5,
            analytics_concurrency: 2,
            analytics_rate_per_second: 10,
            stale_send_threshold_mins: 15,
        }
    }
}

/// Webhook ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Size of the best-effort local dedup window
    pub local_dedup_capacity: usize,
    /// Processed-event ledger retention in days
    pub ledger_retention_days: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            local_dedup_capacity: 10_000,
            ledger_retention_days: 7,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# LeadCadence Configuration
# Environment variables (LEADCADENCE_*) override these settings

[http]
port = 8080
host = "0.0.0.0"

[postgres]
url = "postgres://localhost:5432/leadcadence"
max_connections = 10

[redis]
url = "redis://localhost:6379"
key_prefix = "lc"

[gateway]
base_url = "https://api.brevo.com/v3"
connect_timeout_secs = 10
request_timeout_secs = 30
credential_cache_secs = 60

[queue]
visibility_timeout_secs = 120
max_receives = 5
poll_interval_ms = 250

[scheduler]
lock_ttl_secs = 30
lock_max_retries = 3
lock_base_backoff_ms = 50

[worker]
send_concurrency = 5
send_rate_per_second = 10
followup_concurrency = 3
followup_rate_per_second = 5
analytics_concurrency = 2
analytics_rate_per_second = 10
stale_send_threshold_mins = 15

[ingest]
local_dedup_capacity = 10000
ledger_retention_days = 7

dev_mode = false
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_contract() {
        let config = AppConfig::default();
        assert_eq!(config.worker.send_concurrency, 5);
        assert_eq!(config.worker.send_rate_per_second, 10);
        assert_eq!(config.worker.followup_concurrency, 3);
        assert_eq!(config.worker.analytics_concurrency, 2);
        assert_eq!(config.scheduler.lock_ttl_secs, 30);
        assert_eq!(config.gateway.request_timeout_secs, 30);
        assert_eq!(config.ingest.ledger_retention_days, 7);
    }

    #[test]
    fn example_toml_parses() {
        let config: AppConfig = toml::from_str(&AppConfig::example_toml()).unwrap();
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.queue.max_receives, 5);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str("[http]\nport = 9999\n").unwrap();
        assert_eq!(config.http.port, 9999);
        assert_eq!(config.worker.send_concurrency, 5);
    }
}
