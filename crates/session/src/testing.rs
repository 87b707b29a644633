//! Recording fakes for the transport and broker collaborators.
//!
//! A [`FakeNetwork`] is shared between a [`FakeTransportProvider`] and a
//! [`FakeBroker`]; tests keep a handle to script failures and inspect every
//! interaction after the fakes have been moved into a session manager.

use crate::broker::{BrokerClient, ConnectRequest, MessageHandler};
use crate::error::{BrokerError, TransportError};
use crate::transport::TransportProvider;
use cloudlink_crypto::Credential;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// One observed collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interaction {
    LinkCheck { ready: bool },
    Establish { transport_id: u32, token: String },
    Handshake {
        transport_id: u32,
        client_id: String,
        username: String,
        password: String,
    },
    Subscribe { transport_id: u32, topic: String },
    Publish {
        transport_id: u32,
        topic: String,
        payload: Vec<u8>,
    },
    Poll { transport_id: u32 },
    Reauthenticate { transport_id: u32, password: String },
    Disconnect { transport_id: u32 },
}

#[derive(Debug, Default)]
struct NetworkState {
    link_down_checks: u32,
    establish_failures: u32,
    handshake_failures: u32,
    subscribe_failures: u32,
    publish_error: Option<BrokerError>,
    poll_errors: VecDeque<BrokerError>,
    reauth_supported: bool,
    inbound: VecDeque<(String, Vec<u8>)>,
    next_transport_id: u32,
    journal: Vec<Interaction>,
}

/// Shared script and journal for the fakes.
#[derive(Debug, Clone, Default)]
pub struct FakeNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn provider(&self) -> FakeTransportProvider {
        FakeTransportProvider {
            network: self.clone(),
        }
    }

    pub fn broker(&self) -> FakeBroker {
        FakeBroker {
            network: self.clone(),
            handler: None,
        }
    }

    /// Report the link as down for the next `checks` readiness checks.
    pub fn link_down_for(&self, checks: u32) {
        self.lock().link_down_checks = checks;
    }

    pub fn fail_next_establish(&self, count: u32) {
        self.lock().establish_failures = count;
    }

    pub fn fail_next_handshake(&self, count: u32) {
        self.lock().handshake_failures = count;
    }

    pub fn fail_next_subscribe(&self, count: u32) {
        self.lock().subscribe_failures = count;
    }

    pub fn set_publish_error(&self, error: Option<BrokerError>) {
        self.lock().publish_error = error;
    }

    /// Make the next poll report that the connection dropped.
    pub fn drop_connection(&self) {
        self.lock()
            .poll_errors
            .push_back(BrokerError::ConnectionLost("peer reset".to_string()));
    }

    pub fn fail_next_poll(&self, error: BrokerError) {
        self.lock().poll_errors.push_back(error);
    }

    pub fn set_reauth_supported(&self, supported: bool) {
        self.lock().reauth_supported = supported;
    }

    /// Queue an inbound message for delivery on the next poll.
    pub fn inject_message(&self, topic: &str, payload: &[u8]) {
        self.lock()
            .inbound
            .push_back((topic.to_string(), payload.to_vec()));
    }

    pub fn journal(&self) -> Vec<Interaction> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    pub fn count(&self, predicate: impl Fn(&Interaction) -> bool) -> usize {
        self.lock().journal.iter().filter(|i| predicate(i)).count()
    }

    fn record(&self, interaction: Interaction) {
        self.lock().journal.push(interaction);
    }
}

/// Fake established connection.
#[derive(Debug, PartialEq, Eq)]
pub struct FakeTransport {
    pub id: u32,
}

#[derive(Debug, Clone)]
pub struct FakeTransportProvider {
    network: FakeNetwork,
}

impl TransportProvider for FakeTransportProvider {
    type Transport = FakeTransport;

    fn is_link_ready(&mut self) -> bool {
        let ready = {
            let mut state = self.network.lock();
            if state.link_down_checks > 0 {
                state.link_down_checks -= 1;
                false
            } else {
                true
            }
        };
        self.network.record(Interaction::LinkCheck { ready });
        ready
    }

    fn establish(&mut self, credential: &Credential) -> Result<FakeTransport, TransportError> {
        let mut state = self.network.lock();
        if state.establish_failures > 0 {
            state.establish_failures -= 1;
            return Err(TransportError::Refused("scripted failure".to_string()));
        }

        state.next_transport_id += 1;
        let id = state.next_transport_id;
        state.journal.push(Interaction::Establish {
            transport_id: id,
            token: credential.token().to_string(),
        });
        Ok(FakeTransport { id })
    }
}

pub struct FakeBroker {
    network: FakeNetwork,
    handler: Option<MessageHandler>,
}

impl std::fmt::Debug for FakeBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeBroker")
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl BrokerClient<FakeTransport> for FakeBroker {
    fn handshake(
        &mut self,
        transport: &mut FakeTransport,
        request: &ConnectRequest<'_>,
    ) -> Result<(), BrokerError> {
        let mut state = self.network.lock();
        state.journal.push(Interaction::Handshake {
            transport_id: transport.id,
            client_id: request.client_id.to_string(),
            username: request.username.to_string(),
            password: request.password.to_string(),
        });
        if state.handshake_failures > 0 {
            state.handshake_failures -= 1;
            return Err(BrokerError::Rejected("scripted failure".to_string()));
        }
        Ok(())
    }

    fn subscribe(&mut self, transport: &mut FakeTransport, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.network.lock();
        state.journal.push(Interaction::Subscribe {
            transport_id: transport.id,
            topic: topic.to_string(),
        });
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(BrokerError::Rejected("scripted failure".to_string()));
        }
        Ok(())
    }

    fn publish(
        &mut self,
        transport: &mut FakeTransport,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let mut state = self.network.lock();
        state.journal.push(Interaction::Publish {
            transport_id: transport.id,
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
        match state.publish_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn poll(&mut self, transport: &mut FakeTransport) -> Result<(), BrokerError> {
        let (result, inbound) = {
            let mut state = self.network.lock();
            state.journal.push(Interaction::Poll {
                transport_id: transport.id,
            });
            match state.poll_errors.pop_front() {
                Some(e) => (Err(e), Vec::new()),
                None => (Ok(()), state.inbound.drain(..).collect::<Vec<_>>()),
            }
        };

        if let Some(handler) = self.handler.as_mut() {
            for (topic, payload) in &inbound {
                handler(topic.as_str(), payload.as_slice());
            }
        }
        result
    }

    fn reauthenticate(
        &mut self,
        transport: &mut FakeTransport,
        request: &ConnectRequest<'_>,
    ) -> Result<(), BrokerError> {
        let mut state = self.network.lock();
        if !state.reauth_supported {
            return Err(BrokerError::Unsupported("reauthenticate"));
        }
        state.journal.push(Interaction::Reauthenticate {
            transport_id: transport.id,
            password: request.password.to_string(),
        });
        Ok(())
    }

    fn disconnect(&mut self, transport: &mut FakeTransport) {
        self.network.record(Interaction::Disconnect {
            transport_id: transport.id,
        });
    }

    fn set_message_handler(&mut self, handler: MessageHandler) {
        self.handler = Some(handler);
    }
}
