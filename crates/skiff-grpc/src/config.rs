//! Gateway configuration.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path of the file
        path: String,
        /// Underlying IO error
        source: std::io::Error,
    },
    /// File is not valid JSON or has unknown fields
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path of the file
        path: String,
        /// Underlying parse error
        source: serde_json::Error,
    },
    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings of a running gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Address to listen on
    pub addr: SocketAddr,
    /// Size of the chunks a file read is split into
    pub read_chunk_size: usize,
    /// Largest chunk of interactive job output sent in one message
    pub stream_chunk_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            read_chunk_size: 8192,
            stream_chunk_size: 1024,
        }
    }
}

impl GatewayConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid("read_chunk_size must be positive".into()));
        }
        if self.stream_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "stream_chunk_size must be positive".into(),
            ));
        }
        Ok(())
    }
}
