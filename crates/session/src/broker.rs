//! Broker protocol collaborator contract.
//!
//! The wire framing (MQTT or otherwise) is implemented outside this crate.
//! The session manager drives it through [`BrokerClient`].

use crate::error::BrokerError;
use cloudlink_core::BrokerConfig;
use std::fmt;
use std::time::Duration;

/// Username sent with password-style token authentication. The broker
/// ignores it; the token carries the identity.
pub const BROKER_USERNAME: &str = "unused";

/// Callback receiving inbound `(topic, payload)` messages.
pub type MessageHandler = Box<dyn FnMut(&str, &[u8]) + Send>;

/// Session options passed with every handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// Per-command timeout
    pub timeout: Duration,
}

impl ConnectOptions {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            keep_alive: config.keep_alive(),
            clean_session: config.clean_session,
            timeout: config.timeout(),
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(180),
            clean_session: true,
            timeout: Duration::from_millis(1000),
        }
    }
}

/// Authentication and options for one broker handshake.
pub struct ConnectRequest<'a> {
    pub client_id: &'a str,
    pub username: &'a str,
    /// Signed credential token
    pub password: &'a str,
    pub options: &'a ConnectOptions,
}

impl fmt::Debug for ConnectRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("options", self.options)
            .finish()
    }
}

/// Broker-level operations over an established transport `T`.
pub trait BrokerClient<T> {
    /// Authenticate and open the broker session.
    fn handshake(&mut self, transport: &mut T, request: &ConnectRequest<'_>)
        -> Result<(), BrokerError>;

    fn subscribe(&mut self, transport: &mut T, topic: &str) -> Result<(), BrokerError>;

    /// Hand a message to the broker session. No delivery acknowledgment is
    /// implied.
    fn publish(&mut self, transport: &mut T, topic: &str, payload: &[u8])
        -> Result<(), BrokerError>;

    /// Service keep-alive and dispatch pending inbound messages to the
    /// registered handler.
    fn poll(&mut self, transport: &mut T) -> Result<(), BrokerError>;

    /// Present a new credential without closing the transport.
    fn reauthenticate(
        &mut self,
        _transport: &mut T,
        _request: &ConnectRequest<'_>,
    ) -> Result<(), BrokerError> {
        Err(BrokerError::Unsupported("reauthenticate"))
    }

    /// Close the broker session gracefully.
    fn disconnect(&mut self, transport: &mut T);

    /// Register the inbound message handler, replacing any previous one.
    fn set_message_handler(&mut self, handler: MessageHandler);
}
