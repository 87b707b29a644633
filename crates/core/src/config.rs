//! Configuration management for cloudlink nodes.
//!
//! A node is configured once at startup from a TOML document. Only the
//! `[device]` section is mandatory; every other section falls back to the
//! defaults below.
//!
//! ```toml
//! [device]
//! project_id = "my-project"
//! location = "europe-west1"
//! registry_id = "sensors"
//! device_id = "sensor-7"
//! private_key = "9d:61:b1:9d:..."
//!
//! [broker]
//! use_lts = false
//! host = "mqtt.example.net"
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Earliest plausible synchronized time (Tue Nov 14 2017 07:36:07 UTC).
pub const DEFAULT_MIN_VALID_EPOCH: u64 = 1_510_644_967;

/// Default broker endpoint.
pub const DEFAULT_BROKER_HOST: &str = "mqtt.googleapis.com";

/// Long-term-support broker endpoint, used unless `use_lts = false`.
pub const LTS_BROKER_HOST: &str = "mqtt.2030.ltsapis.goog";

/// Default broker port (MQTT over TLS).
pub const DEFAULT_BROKER_PORT: u16 = 8883;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub device: DeviceConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub credential: CredentialConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Static device identity.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub project_id: String,
    pub location: String,
    pub registry_id: String,
    pub device_id: String,
    /// Hex-encoded P-256 private scalar; `:` separators and whitespace are ignored
    pub private_key: String,
}

impl std::fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("project_id", &self.project_id)
            .field("location", &self.location)
            .field("registry_id", &self.registry_id)
            .field("device_id", &self.device_id)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Use the long-term-support endpoint instead of `host`. On by default
    pub use_lts: bool,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    /// Session command timeout
    pub timeout_ms: u64,
    pub subscribe_config: bool,
    pub subscribe_commands: bool,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BROKER_HOST.to_string(),
            port: DEFAULT_BROKER_PORT,
            use_lts: true,
            keep_alive_secs: 180,
            clean_session: true,
            timeout_ms: 1000,
            subscribe_config: true,
            subscribe_commands: true,
            reconnect_base_ms: 1000,
            reconnect_max_ms: 60_000,
        }
    }
}

impl BrokerConfig {
    /// Host and port the transport should connect to.
    pub fn endpoint(&self) -> (&str, u16) {
        if self.use_lts {
            (LTS_BROKER_HOST, self.port)
        } else {
            (self.host.as_str(), self.port)
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// How an expiring credential is replaced on a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStrategy {
    /// Tear the session down and run the full connect sequence
    #[default]
    Reconnect,
    /// Re-authenticate over the existing transport when the broker allows it
    Reauthenticate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub validity_secs: u64,
    pub refresh_margin_secs: u64,
    pub refresh_strategy: RefreshStrategy,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            validity_secs: 3600,
            refresh_margin_secs: 300,
            refresh_strategy: RefreshStrategy::Reconnect,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Time servers, tried in order; `host` or `host:port`
    pub servers: Vec<String>,
    pub timeout_ms: u64,
    pub min_valid_epoch: u64,
    pub sync_attempts: u32,
    pub retry_delay_ms: u64,
    pub resync_interval_secs: Option<u64>,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            servers: vec!["pool.ntp.org".to_string(), "time.google.com".to_string()],
            timeout_ms: 3000,
            min_valid_epoch: DEFAULT_MIN_VALID_EPOCH,
            sync_attempts: 5,
            retry_delay_ms: 1000,
            resync_interval_secs: None,
        }
    }
}

impl ClockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Network interface whose carrier gates connection attempts
    pub interface: Option<String>,
    pub poll_interval_ms: u64,
    /// Give up after this many polls; wait forever when unset
    pub max_attempts: Option<u32>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            interface: None,
            poll_interval_ms: 1000,
            max_attempts: None,
        }
    }
}

impl LinkConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub interval_secs: u64,
    pub subfolder: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            subfolder: None,
        }
    }
}

impl NodeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let device = &self.device;
        for (field, value) in [
            ("device.project_id", &device.project_id),
            ("device.location", &device.location),
            ("device.registry_id", &device.registry_id),
            ("device.device_id", &device.device_id),
            ("device.private_key", &device.private_key),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::invalid(field, "must not be empty"));
            }
        }

        if !self.broker.use_lts && self.broker.host.trim().is_empty() {
            return Err(ConfigError::invalid("broker.host", "must not be empty"));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::invalid("broker.port", "must not be zero"));
        }
        if self.broker.reconnect_base_ms > self.broker.reconnect_max_ms {
            return Err(ConfigError::invalid(
                "broker.reconnect_base_ms",
                "must not exceed broker.reconnect_max_ms",
            ));
        }

        if self.credential.validity_secs == 0 {
            return Err(ConfigError::invalid(
                "credential.validity_secs",
                "must not be zero",
            ));
        }
        if self.credential.refresh_margin_secs >= self.credential.validity_secs {
            return Err(ConfigError::invalid(
                "credential.refresh_margin_secs",
                format!(
                    "must be below validity_secs ({})",
                    self.credential.validity_secs
                ),
            ));
        }

        if self.clock.servers.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "clock.servers",
                "at least one time server is required",
            ));
        }
        if self.clock.sync_attempts == 0 {
            return Err(ConfigError::invalid(
                "clock.sync_attempts",
                "must not be zero",
            ));
        }
        if self.clock.resync_interval_secs == Some(0) {
            return Err(ConfigError::invalid(
                "clock.resync_interval_secs",
                "must not be zero",
            ));
        }

        if self.telemetry.interval_secs == 0 {
            return Err(ConfigError::invalid(
                "telemetry.interval_secs",
                "must not be zero",
            ));
        }

        Ok(())
    }
}
