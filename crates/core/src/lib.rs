//! Core functionality for cloudlink device nodes.
//!
//! This crate provides configuration, structured logging and the trusted
//! device clock every time-bound credential depends on.

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod sntp;

pub use clock::{
    ClockState, ClockSynchronizer, DeviceClock, InstantClock, ManualClock, MonotonicClock,
    SyncReport, TimeSource,
};
pub use config::{
    BrokerConfig, ClockConfig, CredentialConfig, DeviceConfig, LinkConfig, NodeConfig,
    RefreshStrategy, TelemetryConfig, DEFAULT_MIN_VALID_EPOCH,
};
pub use error::{ClockError, ConfigError, CoreError, Result};
pub use sntp::SntpClient;
