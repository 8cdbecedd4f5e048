//! Client configuration
//!
//! Every field has a default, so an empty TOML file (or no file at all) yields
//! a working configuration. Credentials never live in the file; the
//! `[connection]` section only names the environment variable the binary
//! reads the connection string from.

use crate::channel::ChannelPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the device connection string
pub const DEFAULT_CONNECTION_STRING_ENV: &str = "IOTHUB_DEVICE_CONNECTION_STRING";

/// Config file picked up from the working directory when `--config` is absent
pub const DEFAULT_CONFIG_FILE: &str = "iothub-device.toml";

/// Top-level client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub connection: ConnectionSection,
    pub mqtt: MqttSection,
    pub channel: ChannelSection,
}

/// Where the binary finds its credential
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionSection {
    pub connection_string_env: String,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            connection_string_env: DEFAULT_CONNECTION_STRING_ENV.to_string(),
        }
    }
}

/// MQTT transport settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttSection {
    /// Broker port (8883 for MQTT over TLS)
    pub port: u16,
    /// Disable only for local test brokers
    pub use_tls: bool,
    pub keep_alive_secs: u64,
    /// How long `connect()` waits for the broker's ConnAck
    pub connect_timeout_secs: u64,
    /// Capacity of the request queue between client handle and event loop
    pub request_capacity: usize,
    /// Maximum packet size in bytes, both directions
    pub max_packet_size: usize,
    /// IoT hub api-version appended to the MQTT username
    pub api_version: String,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            port: 8883,
            use_tls: true,
            keep_alive_secs: 60,
            connect_timeout_secs: 30,
            request_capacity: 10,
            max_packet_size: 256 * 1024,
            api_version: "2018-06-30".to_string(),
        }
    }
}

impl MqttSection {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Buffering policy kind for inbound message channels
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelPolicyKind {
    #[default]
    Unbounded,
    Bounded,
}

/// Inbound message channel settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelSection {
    pub policy: ChannelPolicyKind,
    /// Only used by the bounded policy
    pub capacity: usize,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            policy: ChannelPolicyKind::Unbounded,
            capacity: 64,
        }
    }
}

impl ChannelSection {
    pub fn policy(&self) -> ChannelPolicy {
        match self.policy {
            ChannelPolicyKind::Unbounded => ChannelPolicy::Unbounded,
            ChannelPolicyKind::Bounded => ChannelPolicy::Bounded {
                capacity: self.capacity,
            },
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when given, else the default file if present, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::load_from_file(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.connection_string_env.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "connection.connection_string_env must not be empty".to_string(),
            ));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.port must be non-zero".to_string(),
            ));
        }
        if self.mqtt.keep_alive_secs == 0 || self.mqtt.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt timeouts must be at least one second".to_string(),
            ));
        }
        if self.mqtt.request_capacity == 0 || self.mqtt.max_packet_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.request_capacity and mqtt.max_packet_size must be non-zero".to_string(),
            ));
        }
        if self.mqtt.api_version.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.api_version must not be empty".to_string(),
            ));
        }
        if self.channel.policy == ChannelPolicyKind::Bounded && self.channel.capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "bounded channels need a capacity of at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Read the connection string from the configured environment variable
    pub fn connection_string_from_env(&self) -> Result<String, ConfigError> {
        let name = &self.connection.connection_string_env;
        std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.clone()))
    }
}
