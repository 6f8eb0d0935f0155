//! Configuration management for the developer sandbox.
//!
//! This module provides configuration loading with multiple sources:
//! 1. Default values (hardcoded)
//! 2. Configuration file (YAML)
//! 3. Environment variables (override)
//!
//! Environment variables take precedence over config file values, which take
//! precedence over defaults.
//!
//! # Example
//!
//! ```ignore
//! use rsrel_dev::config::DevConfig;
//!
//! // Load from file with env overrides
//! let config = DevConfig::load("rsrel.yaml")?;
//!
//! // Or load from environment only
//! let config = DevConfig::from_env()?;
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::Level;

use rsrel_domain::dispatch::DispatcherConfig;

use crate::observability::LoggingConfig;

/// Sandbox configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct DevConfig {
    /// Dispatcher settings for sandboxes
    #[serde(default)]
    pub sandbox: SandboxSettings,

    /// Request size limits
    #[serde(default)]
    pub limits: LimitSettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Dispatcher settings used by every sandbox.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SandboxSettings {
    /// Maximum traversal depth. Sandboxes never need production-scale depth.
    #[serde(default = "default_max_dispatch_depth")]
    pub max_dispatch_depth: u32,

    /// Timeout for a single check or expansion, in milliseconds
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            max_dispatch_depth: default_max_dispatch_depth(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
        }
    }
}

impl SandboxSettings {
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_max_depth(self.max_dispatch_depth)
            .with_timeout(Duration::from_millis(self.dispatch_timeout_ms))
    }
}

fn default_max_dispatch_depth() -> u32 {
    10
}

fn default_dispatch_timeout_ms() -> u64 {
    10_000
}

/// Limits applied to a sandbox request as a whole.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LimitSettings {
    /// Maximum number of test relationships
    #[serde(default = "default_max_relationships")]
    pub max_relationships: usize,

    /// Maximum schema text size in bytes
    #[serde(default = "default_max_schema_bytes")]
    pub max_schema_bytes: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_relationships: default_max_relationships(),
            max_schema_bytes: default_max_schema_bytes(),
        }
    }
}

fn default_max_relationships() -> usize {
    10_000
}

fn default_max_schema_bytes() -> usize {
    1024 * 1024
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl LoggingSettings {
    /// Converts the settings to a logging configuration.
    ///
    /// Unknown levels fall back to INFO; `DevConfig::validate` rejects them
    /// before this is reached.
    pub fn to_logging_config(&self) -> LoggingConfig {
        let level = self.level.parse::<Level>().unwrap_or(Level::INFO);
        let config = if self.json {
            LoggingConfig::json()
        } else {
            LoggingConfig::text()
        };
        config.with_level(level)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

fn environment() -> Environment {
    // RSREL_SANDBOX__MAX_DISPATCH_DEPTH -> sandbox.max_dispatch_depth
    Environment::with_prefix("RSREL")
        .prefix_separator("_")
        .separator("__")
}

impl DevConfig {
    /// Load configuration from a YAML file with environment variable overrides.
    ///
    /// Environment variables are prefixed with `RSREL_` and use `__` as separator.
    /// For example:
    /// - `RSREL_SANDBOX__MAX_DISPATCH_DEPTH=5` overrides `sandbox.max_dispatch_depth`
    /// - `RSREL_LOGGING__LEVEL=debug` overrides `logging.level`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let config = Config::builder()
            .add_source(Config::try_from(&DevConfig::default())?)
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(environment())
            .build()?;

        let dev_config: DevConfig = config.try_deserialize()?;
        dev_config.validate()?;

        Ok(dev_config)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config = Config::builder()
            .add_source(Config::try_from(&DevConfig::default())?)
            .add_source(environment())
            .build()?;

        let dev_config: DevConfig = config.try_deserialize()?;
        dev_config.validate()?;

        Ok(dev_config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if !(1..=100).contains(&self.sandbox.max_dispatch_depth) {
            return Err(ConfigLoadError::Invalid {
                message: format!(
                    "sandbox.max_dispatch_depth must be between 1 and 100, got: {}",
                    self.sandbox.max_dispatch_depth
                ),
            });
        }

        if self.sandbox.dispatch_timeout_ms == 0 {
            return Err(ConfigLoadError::Invalid {
                message: "sandbox.dispatch_timeout_ms must be greater than 0".to_string(),
            });
        }

        if self.limits.max_relationships == 0 {
            return Err(ConfigLoadError::Invalid {
                message: "limits.max_relationships must be greater than 0".to_string(),
            });
        }

        if self.limits.max_schema_bytes == 0 {
            return Err(ConfigLoadError::Invalid {
                message: "limits.max_schema_bytes must be greater than 0".to_string(),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigLoadError::Invalid {
                message: format!(
                    "logging.level must be one of: {:?}, got: {}",
                    valid_levels, self.logging.level
                ),
            });
        }

        Ok(())
    }
}
