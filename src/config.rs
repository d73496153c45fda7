//! Runtime configuration loaded from TOML.

use idlink_log::{Format, Level, LogConfig};
use idlink_pool::PoolConfig;
use idlink_rpc::BalancerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid TOML or has the wrong shape.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range or inconsistent.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Logging section of the runtime configuration.
///
/// Unset fields fall back to the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Minimum level (`trace`, `debug`, `info`, `warn`, `error`, `off`).
    pub level: Option<String>,
    /// Output format (`pretty`, `compact`, `json`).
    pub format: Option<String>,
    /// Force colors on or off.
    pub color: Option<bool>,
}

/// Top-level runtime configuration.
///
/// ```toml
/// [pool]
/// max_objects = 4
/// max_wait_seconds = 30
///
/// [balancer]
/// name = "sites"
/// policy = "failover"
///
/// [log]
/// level = "debug"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Connector pool settings.
    pub pool: PoolConfig,
    /// Load balancer settings.
    pub balancer: BalancerConfig,
    /// Logging settings.
    pub log: LogSection,
}

impl RuntimeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded runtime configuration");
        Ok(config)
    }

    /// Check every section for consistency.
    pub fn validate(&self) -> ConfigResult<()> {
        self.pool
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.balancer.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "balancer name must not be empty".to_string(),
            ));
        }

        if let Some(level) = &self.log.level
            && Level::parse(level).is_none()
        {
            return Err(ConfigError::Invalid(format!("unknown log level: {level}")));
        }
        if let Some(format) = &self.log.format
            && Format::parse(format).is_none()
        {
            return Err(ConfigError::Invalid(format!("unknown log format: {format}")));
        }
        Ok(())
    }

    /// Logging configuration: the environment, overridden by the `[log]` section.
    pub fn log_config(&self) -> LogConfig {
        self.apply_log(LogConfig::from_env())
    }

    fn apply_log(&self, mut config: LogConfig) -> LogConfig {
        if let Some(level) = self.log.level.as_deref().and_then(Level::parse) {
            config = config.with_level(level);
        }
        if let Some(format) = self.log.format.as_deref().and_then(Format::parse) {
            config = config.with_format(format);
        }
        if let Some(color) = self.log.color {
            config.color = color;
        }
        config
    }
}
