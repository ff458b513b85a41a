//! Client configuration
//!
//! Loads endpoint, reconnect and heartbeat settings from a TOML file. Every
//! field has a default, so a missing file or a partial file is fine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file name
pub const CONFIG_FILE: &str = "election-updates.toml";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Where the update socket lives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndpointConfig {
    /// Origin of the web page the client runs alongside
    pub origin: String,
    /// Explicit server URL; replaces the origin-derived host and port
    pub base_url: Option<String>,
    /// Port the web frontend is served from
    pub web_port: u16,
    /// Port the API server listens on
    pub api_port: u16,
    /// Socket path on the API server
    pub path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:3000".to_string(),
            base_url: None,
            web_port: 3000,
            api_port: 8000,
            path: "/ws/election-updates/".to_string(),
        }
    }
}

/// Exponential backoff for automatic reconnects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect
    pub base_delay_ms: u64,
    /// Growth factor per attempt
    pub multiplier: u32,
    /// Attempts before giving up until the next manual connect
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 3000,
            multiplier: 2,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt: `base * multiplier^(attempt - 1)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = u64::from(self.multiplier).saturating_pow(exponent);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// Whether another attempt may be scheduled after `attempts` so far
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Keepalive settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Ping period while connected
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Silence longer than this marks the connection unhealthy (4 missed pings)
    pub fn stale_after(&self) -> Duration {
        self.interval() * 4
    }
}

/// Full client configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint: EndpointConfig,
    pub reconnect: ReconnectPolicy,
    pub heartbeat: HeartbeatConfig,
}

impl ClientConfig {
    /// Load configuration from a file, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Set the page origin
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.endpoint.origin = origin.into();
        self
    }

    /// Set an explicit server URL
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.endpoint.base_url = base_url;
        self
    }
}
