//! Server configuration

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Failures while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is outside its allowed range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for the event loop. Every field has a serving default, so a
/// config file only names what it overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Idle-sweep period in seconds.
    pub cleanup_interval_s: u64,
    /// Maximum idle time before a connection is evicted, in milliseconds.
    pub connection_timeout_ms: u64,
    /// Combined header and body size before a request fails with `413`.
    pub max_request_size: usize,
    /// Bytes handed to the socket per write syscall.
    pub response_buffer_size: usize,
    /// Task drain cap per loop iteration, so floods cannot starve I/O.
    pub max_tasks_per_iteration: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8082,
            cleanup_interval_s: 30,
            connection_timeout_ms: 30_000,
            max_request_size: 1 << 20,
            response_buffer_size: 8 * 1024,
            max_tasks_per_iteration: 10_000,
        }
    }
}

impl Config {
    /// Loads and validates a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.response_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "response_buffer_size must be non-zero".into(),
            ));
        }
        if self.max_tasks_per_iteration == 0 {
            return Err(ConfigError::Invalid(
                "max_tasks_per_iteration must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
