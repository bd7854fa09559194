//! Server and client configuration.
//!
//! Both configs deserialize from TOML with every field optional; missing
//! fields fall back to [`Default`].
//!
//! ```toml
//! bind_address = "127.0.0.1"
//! port = 7000
//! backlog = 32
//! reap_interval_ms = 500
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 65123;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 10;

/// Default interval between dead-connection sweeps.
pub const DEFAULT_REAP_INTERVAL_MS: u64 = 2_000;

/// Default write timeout (10 seconds)
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 10_000;

/// Size of the per-connection read buffer. One read fills at most this much.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Default bound on outbound connects.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u32 = 10;

/// Configuration for a [`TcpServer`](crate::TcpServer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Local address the listener binds to.
    pub bind_address: IpAddr,

    /// Port used by the CLI when no port is given.
    pub port: u16,

    /// Listen backlog used by the CLI when none is given.
    pub backlog: u32,

    /// Whether the CLI starts the dead-connection reaper.
    pub auto_reap: bool,

    /// Interval between reaper sweeps, in milliseconds.
    pub reap_interval_ms: u64,

    /// Bounded wait before each accept, in seconds. Zero blocks forever.
    pub accept_timeout_secs: u32,

    /// Upper bound on a single send, in milliseconds.
    pub write_timeout_ms: u64,

    /// Per-connection read buffer size in bytes.
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            auto_reap: true,
            reap_interval_ms: DEFAULT_REAP_INTERVAL_MS,
            accept_timeout_secs: 0,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ServerConfig {
    /// Parses a config from TOML text and validates it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&read_config(path.as_ref())?)
    }

    /// Checks that every knob is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 {
            return Err(ConfigError::Invalid("backlog must be at least 1".to_string()));
        }
        if self.reap_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "reap_interval_ms must be at least 1".to_string(),
            ));
        }
        validate_io(self.write_timeout_ms, self.read_buffer_size)
    }

    /// Reaper sweep interval.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Write timeout applied to every send.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Configuration for a [`TcpClient`](crate::TcpClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bound on the outbound connect, in seconds. Zero blocks until the OS gives up.
    pub connect_timeout_secs: u32,

    /// Upper bound on a single send, in milliseconds.
    pub write_timeout_ms: u64,

    /// Read buffer size in bytes.
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    /// Parses a config from TOML text and validates it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&read_config(path.as_ref())?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_io(self.write_timeout_ms, self.read_buffer_size)
    }

    /// Write timeout applied to every send.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

fn validate_io(write_timeout_ms: u64, read_buffer_size: usize) -> Result<(), ConfigError> {
    if write_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "write_timeout_ms must be at least 1".to_string(),
        ));
    }
    if read_buffer_size == 0 {
        return Err(ConfigError::Invalid(
            "read_buffer_size must be at least 1".to_string(),
        ));
    }
    Ok(())
}
