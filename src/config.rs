/**
 * config.rs
 *
 * JSON client configuration
 */

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::nat_traversal::{DialConfig, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Client configuration file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Rendezvous endpoint ("host:port")
    pub public_server_address: String,

    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,

    #[serde(default)]
    pub punch_timeout_secs: Option<u64>,

    #[serde(default)]
    pub retry_interval_ms: Option<u64>,

    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Dialer settings, falling back to [`DialConfig::default`] for anything
    /// not set in the file
    pub fn dial_config(&self) -> DialConfig {
        let defaults = DialConfig::default();

        DialConfig {
            handshake_timeout: self
                .handshake_timeout_secs
                .map(Duration::from_secs)
                .or(defaults.handshake_timeout),
            punch_timeout: self
                .punch_timeout_secs
                .map(Duration::from_secs)
                .or(defaults.punch_timeout),
            retry: RetryPolicy {
                interval: self
                    .retry_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.interval),
                max_attempts: self.max_attempts.or(defaults.retry.max_attempts),
            },
        }
    }
}
