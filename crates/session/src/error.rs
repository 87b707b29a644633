//! Error types for session establishment and publishing.

use cloudlink_crypto::CredentialError;
use std::fmt;
use thiserror::Error;

/// Failures of the secure transport collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("Transport timed out")]
    Timeout,
}

/// Failures reported by the broker protocol collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker refused the request (bad credentials, unknown device, ...)
    #[error("Broker rejected request: {0}")]
    Rejected(String),

    /// The session is gone
    #[error("Broker connection lost: {0}")]
    ConnectionLost(String),

    #[error("Broker did not answer in time")]
    Timeout,

    #[error("Broker protocol error: {0}")]
    Protocol(String),

    #[error("Operation not supported by broker client: {0}")]
    Unsupported(&'static str),
}

impl BrokerError {
    /// Whether the session can no longer be used after this error.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Timeout)
    }
}

/// Step of the connect sequence that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStep {
    Link,
    Credential,
    Transport,
    Handshake,
    Subscribe,
}

impl ConnectStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Link => "link",
            Self::Credential => "credential",
            Self::Transport => "transport",
            Self::Handshake => "broker handshake",
            Self::Subscribe => "subscribe",
        }
    }
}

impl fmt::Display for ConnectStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a `connect()` attempt. The session is `Disconnected` afterwards.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Link down after {attempts} readiness checks")]
    LinkDown { attempts: u32 },

    #[error("Credential issuance failed: {0}")]
    Credential(#[from] CredentialError),

    #[error("Transport establishment failed: {0}")]
    Transport(#[source] TransportError),

    #[error("Broker handshake failed: {0}")]
    Handshake(#[source] BrokerError),

    #[error("Subscription to {topic} failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },
}

impl ConnectError {
    pub fn step(&self) -> ConnectStep {
        match self {
            Self::LinkDown { .. } => ConnectStep::Link,
            Self::Credential(_) => ConnectStep::Credential,
            Self::Transport(_) => ConnectStep::Transport,
            Self::Handshake(_) => ConnectStep::Handshake,
            Self::Subscribe { .. } => ConnectStep::Subscribe,
        }
    }
}

/// Failure of a publish call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Publish attempted while the session is not `Connected`
    #[error("Session is not connected")]
    NotConnected,

    #[error("Invalid telemetry subfolder {0:?}")]
    InvalidSubfolder(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
