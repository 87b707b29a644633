//! Broker session management for cloudlink devices.
//!
//! The [`SessionManager`] owns the connection lifecycle: it waits for the
//! link, obtains a credential against trusted time, establishes the secure
//! transport, performs the broker handshake and subscriptions, and keeps
//! the session authenticated until it is lost or closed.
//!
//! Transport and broker framing are collaborators behind the
//! [`TransportProvider`] and [`BrokerClient`] traits.

pub mod broker;
pub mod error;
pub mod manager;
pub mod topics;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use broker::{BrokerClient, ConnectOptions, ConnectRequest, MessageHandler, BROKER_USERNAME};
pub use error::{BrokerError, ConnectError, ConnectStep, PublishError, TransportError};
pub use manager::{Maintenance, SessionManager, SessionSettings, SessionState, StateTransition};
pub use topics::{DeviceTopics, TelemetryMessage};
pub use transport::{LinkWait, TransportProvider};
