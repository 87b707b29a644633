//! Core error types

use thiserror::Error;

/// Errors raised while establishing trusted wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    /// No time source answered
    #[error("time source unreachable: {0}")]
    SourceUnreachable(String),

    /// A time source answered with something unusable
    #[error("invalid time source response: {0}")]
    InvalidResponse(String),

    /// The round trip succeeded but the reported time is implausibly old
    #[error("synchronized time {observed} is behind the sanity bound {minimum}")]
    BehindSanityBound { observed: u64, minimum: u64 },

    /// Time was requested before any successful synchronization
    #[error("clock has not been synchronized")]
    NotSynchronized,
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file is not valid TOML for this schema
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field holds a value the node cannot run with
    #[error("invalid configuration field '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Core error type for cloudlink
#[derive(Debug, Error)]
pub enum CoreError {
    /// Clock error
    #[error(transparent)]
    Clock(#[from] ClockError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
