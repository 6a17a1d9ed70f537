//! Configuration management for meshplane
//!
//! Settings come from a TOML file or from `MESHPLANE_<SECTION>_<KEY>`
//! environment variables layered over the defaults.

use crate::core_store::store::StoreEngine;
use crate::logging::{LogConfig, LogLevel};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store configuration
    pub store: StoreConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Engine to use. Detected from the data directory when unset.
    pub engine: Option<StoreEngine>,

    /// Directory holding `store.json` or `store.db`
    pub data_dir: PathBuf,

    /// SQLite pool size, one per core when unset
    pub max_open_conns: Option<usize>,

    /// How long a SQLite connection waits on a locked database
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include target module
    pub with_target: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Record store timings through the `metrics` facade
    pub enabled: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            engine: None,
            data_dir: PathBuf::from("./data"),
            max_open_conns: None,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl LoggingConfig {
    /// Logging setup for `init_logging_with_config`
    pub fn to_log_config(&self) -> Result<LogConfig, ConfigError> {
        let level: LogLevel = self.level.parse().map_err(ConfigError::InvalidValue)?;
        Ok(LogConfig::new(level)
            .with_target(self.with_target)
            .json_format(self.json_format))
    }
}

fn parse_var<T>(name: &str, what: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("Invalid {}: {}", what, e))),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: MESHPLANE_<SECTION>_<KEY>
    /// Example: MESHPLANE_STORE_DATA_DIR=/var/lib/meshplane
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Store config
        if let Some(engine) = parse_var::<StoreEngine>("MESHPLANE_STORE_ENGINE", "store engine")? {
            config.store.engine = Some(engine);
        }
        if let Ok(data_dir) = env::var("MESHPLANE_STORE_DATA_DIR") {
            config.store.data_dir = PathBuf::from(data_dir);
        }
        if let Some(conns) = parse_var::<usize>("MESHPLANE_STORE_MAX_OPEN_CONNS", "max open connections")? {
            config.store.max_open_conns = Some(conns);
        }
        if let Ok(timeout) = env::var("MESHPLANE_STORE_BUSY_TIMEOUT") {
            config.store.busy_timeout = humantime_serde::re::humantime::parse_duration(&timeout)
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid busy timeout: {}", e)))?;
        }

        // Logging config
        if let Ok(level) = env::var("MESHPLANE_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(json) = parse_var::<bool>("MESHPLANE_LOG_JSON", "JSON flag")? {
            config.logging.json_format = json;
        }

        // Metrics config
        if let Some(enabled) = parse_var::<bool>("MESHPLANE_METRICS_ENABLED", "metrics flag")? {
            config.metrics.enabled = enabled;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "data_dir must not be empty".to_string(),
            ));
        }

        if self.store.max_open_conns == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_open_conns must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.engine, None);
        assert_eq!(config.store.busy_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.store.max_open_conns = Some(0);
        assert!(config.validate().is_err());

        config = Config::default();
        config.store.data_dir = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            [store]
            engine = "sqlite"
            data_dir = "/var/lib/meshplane"
            busy_timeout = "250ms"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.store.engine, Some(StoreEngine::Sqlite));
        assert_eq!(config.store.busy_timeout, Duration::from_millis(250));
        assert_eq!(config.logging.level, "debug");
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshplane.toml");

        let mut config = Config::default();
        config.store.engine = Some(StoreEngine::JsonFile);
        config.store.max_open_conns = Some(4);
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.store.engine, Some(StoreEngine::JsonFile));
        assert_eq!(loaded.store.max_open_conns, Some(4));
    }

    #[test]
    fn test_logging_config_conversion() {
        let logging = LoggingConfig {
            level: "warn".to_string(),
            json_format: true,
            with_target: false,
        };
        let log_config = logging.to_log_config().unwrap();
        assert_eq!(log_config.level, LogLevel::Warn);
        assert!(log_config.json_format);
    }
}
