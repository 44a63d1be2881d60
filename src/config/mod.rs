//! Configuration management

use crate::connection::ConnectionTimeouts;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Protocol timeout settings
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Protocol timeouts, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Channel read timeout
    pub channel_read: u64,
    /// How long an inbound payload waits for a stalled channel
    pub channel_write: u64,
    /// Peer-status probe wait
    pub peer_status: u64,
    /// Start-relay acknowledgement wait
    pub relay_start: u64,
    /// Stop-relay acknowledgement wait
    pub relay_stop: u64,
    /// NOOP keepalive interval for the external keepalive driver
    pub keepalive_interval: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            channel_read: 30,
            channel_write: 30,
            peer_status: 10,
            relay_start: 120,
            relay_stop: 10,
            keepalive_interval: 30,
        }
    }
}

impl TimeoutConfig {
    /// The timeout set a connection is constructed with
    pub fn connection_timeouts(&self) -> ConnectionTimeouts {
        ConnectionTimeouts {
            channel_read: Duration::from_secs(self.channel_read),
            channel_write: Duration::from_secs(self.channel_write),
            peer_status: Duration::from_secs(self.peer_status),
            relay_start: Duration::from_secs(self.relay_start),
            relay_stop: Duration::from_secs(self.relay_stop),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }
}
