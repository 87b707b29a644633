//! Secure transport collaborator contract.

use crate::error::TransportError;
use cloudlink_core::LinkConfig;
use cloudlink_crypto::Credential;
use std::time::Duration;

/// Supplies established secure byte streams to the broker endpoint.
///
/// TLS setup and certificate validation live behind this trait.
pub trait TransportProvider {
    /// An established connection, closed when dropped.
    type Transport;

    /// Whether the physical or network link is present.
    fn is_link_ready(&mut self) -> bool;

    /// Open a connection authenticated with `credential` where the transport
    /// uses it (e.g. TLS client identity); password-style brokers ignore it.
    fn establish(&mut self, credential: &Credential) -> Result<Self::Transport, TransportError>;
}

/// How long `connect()` waits for the link before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkWait {
    pub poll_interval: Duration,
    /// `None` waits until the link comes up
    pub max_attempts: Option<u32>,
}

impl LinkWait {
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_attempts: config.max_attempts,
        }
    }
}

impl Default for LinkWait {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}
