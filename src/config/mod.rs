//! Application configuration.
//!
//! Aggregates the configuration sections of every module into a single
//! `Config` that can be loaded from YAML files or environment variables.

mod messaging;
mod storage;

pub use messaging::{MessagingConfig, MessagingType};
pub use storage::StorageConfig;

use serde::Deserialize;

use crate::circuit::CircuitBreakerConfig;
use crate::monitoring::MonitoringConfig;
pub use crate::outbox::OUTBOX_ENABLED_ENV_VAR;
use crate::outbox::OutboxConfig;
use crate::reliability::RetryPolicy;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";
/// Environment variable selecting JSON log output.
pub const LOG_FORMAT_ENV_VAR: &str = "COURIER_LOG_FORMAT";

/// Configuration loading failed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Admin HTTP surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    /// Listen port. 0 picks an ephemeral port.
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8088,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub outbox: OutboxConfig,
    pub messaging: MessagingConfig,
    /// Default retry policy for handlers registered without one.
    pub reliability: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub monitoring: MonitoringConfig,
    pub admin: AdminConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `courier.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `COURIER_CONFIG` environment variable (if set)
    /// 4. Environment variables with `COURIER__` prefix, `__` between sections
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
