//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "leadcadence.toml",
    "./config/config.toml",
    "/etc/leadcadence/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("LEADCADENCE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("LEADCADENCE_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("LEADCADENCE_HTTP_HOST") {
            config.http.host = val;
        }

        // Postgres
        if let Ok(val) = env::var("LEADCADENCE_DATABASE_URL").or_else(|_| env::var("DATABASE_URL"))
        {
            config.postgres.url = val;
        }
        if let Ok(val) = env::var("LEADCADENCE_DATABASE_MAX_CONNECTIONS") {
            if let Ok(max) = val.parse() {
                config.postgres.max_connections = max;
            }
        }

        // Redis
        if let Ok(val) = env::var("LEADCADENCE_REDIS_URL").or_else(|_| env::var("REDIS_URL")) {
            config.redis.url = val;
        }
        if let Ok(val) = env::var("LEADCADENCE_REDIS_KEY_PREFIX") {
            config.redis.key_prefix = val;
        }

        // Gateway (URL override is the testing hook)
        if let Ok(val) = env::var("LEADCADENCE_GATEWAY_BASE_URL") {
            config.gateway.base_url = val;
        }
        if let Ok(val) = env::var("LEADCADENCE_GATEWAY_TIMEOUT_SECS") {
            if let Ok(timeout) = val.parse() {
                config.gateway.request_timeout_secs = timeout;
            }
        }

        // Queue
        if let Ok(val) = env::var("LEADCADENCE_QUEUE_VISIBILITY_TIMEOUT_SECS") {
            if let Ok(timeout) = val.parse() {
                config.queue.visibility_timeout_secs = timeout;
            }
        }
        if let Ok(val) = env::var("LEADCADENCE_QUEUE_MAX_RECEIVES") {
            if let Ok(max) = val.parse() {
                config.queue.max_receives = max;
            }
        }

        // Scheduler
        if let Ok(val) = env::var("LEADCADENCE_LOCK_TTL_SECS") {
            if let Ok(ttl) = val.parse() {
                config.scheduler.lock_ttl_secs = ttl;
            }
        }

        // Worker pools
        if let Ok(val) = env::var("LEADCADENCE_SEND_CONCURRENCY") {
            if let Ok(n) = val.parse() {
                config.worker.send_concurrency = n;
            }
        }
        if let Ok(val) = env::var("LEADCADENCE_SEND_RATE_PER_SECOND") {
            if let Ok(n) = val.parse() {
                config.worker.send_rate_per_second = n;
            }
        }

        // General
        if let Ok(val) = env::var("LEADCADENCE_DEV_MODE") {
            config.dev_mode = val.parse().unwrap_or(false);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let loader = ConfigLoader::with_path("/nonexistent/leadcadence.toml");
        let config = loader.load().unwrap();
        assert_eq!(config.http.port, AppConfig::default().http.port);
    }

    #[test]
    fn explicit_file_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[worker]\nsend_concurrency = 7").unwrap();

        let loader = ConfigLoader::with_path(file.path());
        let config = loader.load().unwrap();
        assert_eq!(config.worker.send_concurrency, 7);
        // Untouched sections keep their defaults.
        assert_eq!(config.worker.followup_concurrency, 3);
    }
}
