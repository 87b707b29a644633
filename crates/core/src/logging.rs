//! Structured logging infrastructure for cloudlink.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter applied when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines for a serial console or terminal
    #[default]
    Pretty,
    /// One JSON object per event, for log shippers
    Json,
}

/// Initialize the logging system.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level. Calling this more than once is
/// harmless; only the first subscriber is installed.
///
/// # Example
/// ```no_run
/// use cloudlink_core::logging::{self, LogFormat};
///
/// logging::init(LogFormat::Json);
/// tracing::info!(device_id = "sensor-7", "Node started");
/// ```
pub fn init(format: LogFormat) {
    let filter = build_filter();
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Logging already initialized");
    }
}

fn build_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
