//! Client configuration.
//!
//! Built in code through the builder methods or loaded from a TOML file:
//!
//! ```toml
//! host = "db.example.com"
//! port = 4100
//! connect_timeout = "5s"
//! batch_size = 2000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};
use crate::protocol::DEFAULT_BATCH_SIZE;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host.
    pub host: String,

    /// Server port.
    pub port: u16,

    /// Timeout for establishing the TCP connection.
    /// Default: 5s
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Socket read timeout. `None` blocks indefinitely, which is what the
    /// server expects: a slow table read is not an error.
    /// Default: none
    #[serde(default, with = "humantime_serde")]
    pub read_timeout: Option<Duration>,

    /// Rows requested per multi-row fetch.
    /// Default: 2000
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Disable Nagle's algorithm on the socket.
    /// Default: true
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(5000)
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_nodelay() -> bool {
    true
}

impl ClientConfig {
    /// Creates a configuration for the given server.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: default_connect_timeout(),
            read_timeout: None,
            batch_size: default_batch_size(),
            nodelay: default_nodelay(),
        }
    }

    /// Sets the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the socket read timeout.
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the multi-row fetch size.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Enables or disables `TCP_NODELAY`.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Returns the `host:port` string.
    pub fn connection_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ClientResult<()> {
        if self.host.trim().is_empty() {
            return Err(ClientError::InvalidConfig("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ClientError::InvalidConfig("port must not be 0".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(ClientError::InvalidConfig(
                "connect_timeout must be positive".into(),
            ));
        }
        if self.read_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ClientError::InvalidConfig(
                "read_timeout must be positive when set".into(),
            ));
        }
        if self.batch_size == 0 || i32::try_from(self.batch_size).is_err() {
            return Err(ClientError::InvalidConfig(format!(
                "batch_size must be between 1 and {}",
                i32::MAX
            )));
        }
        Ok(())
    }

    /// Parses a TOML document.
    pub fn from_toml_str(content: &str) -> ClientResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ClientError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Serializes the configuration as TOML.
    pub fn to_toml_string(&self) -> ClientResult<String> {
        toml::to_string_pretty(self).map_err(|e| ClientError::InvalidConfig(e.to_string()))
    }
}
