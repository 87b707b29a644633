//! Connection state machine for the broker session.
//!
//! # State Transitions
//!
//! ```text
//! Disconnected
//!     ↓ (connect)
//! Connecting ──(any step fails)──→ Disconnected
//!     ↓ (link up, credential, transport, handshake, subscriptions)
//! Connected ──(loss, expiry, teardown)──→ Disconnected
//! ```
//!
//! There is no terminal state; a dropped session is re-entered through
//! `connect()`. All mutating operations take `&mut self`, so at most one
//! connect and at most one credential refresh are ever in flight.

use crate::broker::{BrokerClient, ConnectOptions, ConnectRequest, MessageHandler, BROKER_USERNAME};
use crate::error::{BrokerError, ConnectError, PublishError};
use crate::topics::{DeviceTopics, TelemetryMessage};
use crate::transport::{LinkWait, TransportProvider};
use cloudlink_core::{DeviceClock, NodeConfig, RefreshStrategy};
use cloudlink_crypto::{Credential, CredentialError, CredentialIssuer};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum number of state transitions to track in history.
const MAX_HISTORY_SIZE: usize = 32;

/// Broker session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

/// Record of a state transition for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub reason: String,
    /// Device time of the transition, when the clock is trusted
    pub at: Option<u64>,
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Maintenance {
    /// Not connected; nothing to maintain
    Idle,
    /// Connected and the credential is outside its refresh margin
    Healthy,
    /// The credential was replaced and the session is connected
    Refreshed,
    /// The session dropped and is now `Disconnected`
    SessionLost,
}

/// Tunables for the session manager.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub refresh_strategy: RefreshStrategy,
    pub link_wait: LinkWait,
    pub connect_options: ConnectOptions,
    pub subscribe_config: bool,
    pub subscribe_commands: bool,
}

impl SessionSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            refresh_strategy: config.credential.refresh_strategy,
            link_wait: LinkWait::from_config(&config.link),
            connect_options: ConnectOptions::from_config(&config.broker),
            subscribe_config: config.broker.subscribe_config,
            subscribe_commands: config.broker.subscribe_commands,
        }
    }
}

/// Sequences link readiness, credential, transport and broker handshake
/// into one `connect()` and keeps the session authenticated afterwards.
pub struct SessionManager<P, B>
where
    P: TransportProvider,
    B: BrokerClient<P::Transport>,
{
    provider: P,
    broker: B,
    issuer: CredentialIssuer,
    clock: Arc<DeviceClock>,
    settings: SessionSettings,
    topics: DeviceTopics,
    client_id: String,
    state: SessionState,
    transport: Option<P::Transport>,
    credential: Option<Credential>,
    history: VecDeque<StateTransition>,
}

impl<P, B> SessionManager<P, B>
where
    P: TransportProvider,
    B: BrokerClient<P::Transport>,
{
    pub fn new(
        issuer: CredentialIssuer,
        clock: Arc<DeviceClock>,
        provider: P,
        broker: B,
        settings: SessionSettings,
    ) -> Self {
        let topics = DeviceTopics::new(issuer.identity().device_id());
        let client_id = issuer.identity().client_id();

        Self {
            provider,
            broker,
            issuer,
            clock,
            settings,
            topics,
            client_id,
            state: SessionState::Disconnected,
            transport: None,
            credential: None,
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// `Connected` with a credential that has not yet expired.
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected && !self.credential_expired()
    }

    /// An untrusted clock or a missing credential count as expired.
    fn credential_expired(&self) -> bool {
        match (&self.credential, self.clock.now()) {
            (Some(credential), Some(now)) => credential.is_expired(now),
            _ => true,
        }
    }

    /// Tear down a `Connected` session whose credential has expired.
    /// Returns whether the session is still usable.
    fn ensure_live(&mut self) -> bool {
        if self.state != SessionState::Connected {
            return false;
        }
        if self.credential_expired() {
            warn!("Credential expired while connected, tearing down");
            self.teardown("credential expired");
            return false;
        }
        true
    }

    /// Credential of the current or most recent session.
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn topics(&self) -> &DeviceTopics {
        &self.topics
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Register the inbound message handler with the broker collaborator.
    pub fn set_message_handler(&mut self, handler: MessageHandler) {
        self.broker.set_message_handler(handler);
    }

    /// Run the connect sequence. A no-op when already connected.
    pub fn connect(&mut self) -> Result<(), ConnectError> {
        if self.ensure_live() {
            debug!("connect() while connected, nothing to do");
            return Ok(());
        }

        self.transition(SessionState::Connecting, "connect requested");

        match self.establish_session() {
            Ok(transport) => {
                self.transport = Some(transport);
                self.transition(SessionState::Connected, "session established");
                info!(
                    client_id = %self.client_id,
                    expires_at = self.credential.as_ref().map_or(0, Credential::expires_at),
                    "Broker session connected"
                );
                Ok(())
            }
            Err(e) => {
                self.transition(
                    SessionState::Disconnected,
                    format!("{} step failed", e.step()),
                );
                warn!(step = %e.step(), error = %e, "Connect failed");
                Err(e)
            }
        }
    }

    fn establish_session(&mut self) -> Result<P::Transport, ConnectError> {
        self.wait_for_link()?;
        let credential = self.current_credential()?;

        let mut transport = self
            .provider
            .establish(&credential)
            .map_err(ConnectError::Transport)?;

        let request = ConnectRequest {
            client_id: &self.client_id,
            username: BROKER_USERNAME,
            password: credential.token(),
            options: &self.settings.connect_options,
        };
        self.broker
            .handshake(&mut transport, &request)
            .map_err(ConnectError::Handshake)?;

        for topic in self.subscriptions() {
            if let Err(source) = self.broker.subscribe(&mut transport, &topic) {
                self.broker.disconnect(&mut transport);
                return Err(ConnectError::Subscribe { topic, source });
            }
            debug!(topic = %topic, "Subscribed");
        }

        Ok(transport)
    }

    fn wait_for_link(&mut self) -> Result<(), ConnectError> {
        let wait = self.settings.link_wait;
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);
            if self.provider.is_link_ready() {
                if attempts > 1 {
                    info!(attempts, "Link is up");
                }
                return Ok(());
            }
            if wait.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(ConnectError::LinkDown { attempts });
            }
            debug!(attempts, "Waiting for link");
            std::thread::sleep(wait.poll_interval);
        }
    }

    /// Reuse the stored credential unless it is due for refresh; otherwise
    /// issue and install a new one.
    fn current_credential(&mut self) -> Result<Credential, CredentialError> {
        let now = self.clock.now().ok_or(CredentialError::UntrustedClock)?;

        match &self.credential {
            Some(existing) if !self.issuer.needs_refresh(existing, now) => {
                debug!(
                    remaining_secs = existing.remaining_secs(now),
                    "Reusing credential"
                );
                Ok(existing.clone())
            }
            _ => {
                let fresh = self.issuer.issue(now)?;
                self.credential = Some(fresh.clone());
                Ok(fresh)
            }
        }
    }

    fn subscriptions(&self) -> Vec<String> {
        let mut topics = Vec::with_capacity(2);
        if self.settings.subscribe_config {
            topics.push(self.topics.config().to_string());
        }
        if self.settings.subscribe_commands {
            topics.push(self.topics.commands().to_string());
        }
        topics
    }

    /// Publish telemetry to the events topic or one of its subfolders.
    ///
    /// Fails with [`PublishError::NotConnected`] without touching the
    /// transport unless the session is `Connected` on an unexpired
    /// credential. An expired session is torn down. Never reconnects.
    pub fn publish(&mut self, subfolder: Option<&str>, payload: &[u8]) -> Result<(), PublishError> {
        if !self.ensure_live() {
            return Err(PublishError::NotConnected);
        }

        let message = TelemetryMessage::new(subfolder, payload);
        let topic = self.topics.telemetry_topic(message.subfolder())?;
        self.publish_to(&topic, message.payload())
    }

    /// Publish a device state report.
    pub fn publish_state(&mut self, payload: &[u8]) -> Result<(), PublishError> {
        if !self.ensure_live() {
            return Err(PublishError::NotConnected);
        }

        let topic = self.topics.state().to_string();
        self.publish_to(&topic, payload)
    }

    fn publish_to(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(PublishError::NotConnected);
        };

        match self.broker.publish(transport, topic, payload) {
            Ok(()) => {
                debug!(topic, bytes = payload.len(), "Published");
                Ok(())
            }
            Err(e) => {
                if e.is_connection_loss() {
                    self.mark_lost(&e.to_string());
                }
                Err(PublishError::Broker(e))
            }
        }
    }

    /// Service the live session: detect loss and refresh the credential
    /// strictly before it expires.
    pub fn maintain(&mut self) -> Result<Maintenance, ConnectError> {
        if self.state != SessionState::Connected {
            return Ok(Maintenance::Idle);
        }

        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = self.broker.poll(transport) {
                if e.is_connection_loss() {
                    self.mark_lost(&e.to_string());
                    return Ok(Maintenance::SessionLost);
                }
                warn!(error = %e, "Broker poll reported an error");
            }
        }

        let now = self.clock.now().ok_or(CredentialError::UntrustedClock)?;
        let (expired, due) = match &self.credential {
            Some(credential) => (
                credential.is_expired(now),
                self.issuer.needs_refresh(credential, now),
            ),
            None => (true, true),
        };

        if !due {
            return Ok(Maintenance::Healthy);
        }

        if expired {
            warn!(now, "Credential expired while connected, tearing down");
            self.teardown("credential expired");
        }

        self.refresh(now)?;
        Ok(Maintenance::Refreshed)
    }

    fn refresh(&mut self, now: u64) -> Result<(), ConnectError> {
        info!(strategy = ?self.settings.refresh_strategy, "Refreshing credential");

        let reauthenticate = self.settings.refresh_strategy == RefreshStrategy::Reauthenticate;
        if reauthenticate && self.is_connected() {
            match self.reauthenticate(now) {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "Re-authentication failed, reconnecting"),
            }
        }

        self.teardown("credential refresh");
        self.connect()
    }

    fn reauthenticate(&mut self, now: u64) -> Result<(), ConnectError> {
        // Installed before use so a fallback reconnect reuses it
        let fresh = self.issuer.issue(now)?;
        self.credential = Some(fresh);

        let (Some(transport), Some(credential)) =
            (self.transport.as_mut(), self.credential.as_ref())
        else {
            return Err(ConnectError::Handshake(BrokerError::ConnectionLost(
                "no transport".to_string(),
            )));
        };

        let request = ConnectRequest {
            client_id: &self.client_id,
            username: BROKER_USERNAME,
            password: credential.token(),
            options: &self.settings.connect_options,
        };
        self.broker
            .reauthenticate(transport, &request)
            .map_err(ConnectError::Handshake)?;

        info!(
            expires_at = credential.expires_at(),
            "Re-authenticated over existing transport"
        );
        Ok(())
    }

    /// Close the session and return to `Disconnected`. The credential is
    /// kept for reuse by the next `connect()`.
    pub fn disconnect(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.teardown("explicit disconnect");
    }

    fn teardown(&mut self, reason: &str) {
        if let Some(mut transport) = self.transport.take() {
            self.broker.disconnect(&mut transport);
        }
        if self.state != SessionState::Disconnected {
            self.transition(SessionState::Disconnected, reason);
        }
    }

    fn mark_lost(&mut self, reason: &str) {
        warn!(reason, "Broker session lost");
        self.transport = None;
        self.transition(SessionState::Disconnected, format!("lost: {reason}"));
    }

    fn transition(&mut self, to: SessionState, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(from = %self.state, to = %to, reason = %reason, "Session transition");

        if self.history.len() >= MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(StateTransition {
            from: self.state,
            to,
            reason,
            at: self.clock.now(),
        });
        self.state = to;
    }
}

impl<P, B> fmt::Debug for SessionManager<P, B>
where
    P: TransportProvider,
    B: BrokerClient<P::Transport>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("credential", &self.credential)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectStep;
    use crate::testing::{FakeBroker, FakeNetwork, FakeTransportProvider, Interaction};
    use cloudlink_core::{ManualClock, DEFAULT_MIN_VALID_EPOCH};
    use cloudlink_crypto::CredentialPolicy;
    use cloudlink_identity::{DeviceIdentity, PrivateKeyMaterial};
    use std::sync::Mutex;
    use std::time::Duration;

    const BOOT_TIME: u64 = 1_610_000_000;

    struct Harness {
        network: FakeNetwork,
        monotonic: Arc<ManualClock>,
        clock: Arc<DeviceClock>,
        session: SessionManager<FakeTransportProvider, FakeBroker>,
    }

    impl Harness {
        fn new(settings: SessionSettings) -> Self {
            let network = FakeNetwork::new();
            let monotonic = Arc::new(ManualClock::new());
            let clock = Arc::new(DeviceClock::with_monotonic(
                DEFAULT_MIN_VALID_EPOCH,
                monotonic.clone(),
            ));
            let identity = DeviceIdentity::new(
                "demo-project",
                "us-central1",
                "sensors",
                "sensor-7",
                PrivateKeyMaterial::from_bytes([7u8; 32]),
            )
            .unwrap();
            let issuer =
                CredentialIssuer::new(identity, CredentialPolicy::new(3600, 300).unwrap())
                    .unwrap();
            let session = SessionManager::new(
                issuer,
                clock.clone(),
                network.provider(),
                network.broker(),
                settings,
            );

            Self {
                network,
                monotonic,
                clock,
                session,
            }
        }

        fn synced(settings: SessionSettings) -> Self {
            let harness = Self::new(settings);
            harness.clock.apply(BOOT_TIME).unwrap();
            harness
        }

        fn advance(&self, secs: u64) {
            self.monotonic.advance(Duration::from_secs(secs));
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            link_wait: LinkWait {
                poll_interval: Duration::ZERO,
                max_attempts: None,
            },
            subscribe_config: true,
            subscribe_commands: true,
            ..SessionSettings::default()
        }
    }

    fn is_establish(i: &Interaction) -> bool {
        matches!(i, Interaction::Establish { .. })
    }

    #[test]
    fn test_initial_state_is_disconnected() {
        let harness = Harness::synced(settings());

        assert_eq!(harness.session.state(), SessionState::Disconnected);
        assert!(harness.session.credential().is_none());
    }

    #[test]
    fn test_connect_sequence() {
        let mut harness = Harness::synced(settings());

        harness.session.connect().unwrap();

        assert_eq!(harness.session.state(), SessionState::Connected);
        let credential = harness.session.credential().unwrap();
        assert_eq!(credential.issued_at(), BOOT_TIME);
        assert_eq!(credential.expires_at(), BOOT_TIME + 3600);

        let token = credential.token().to_string();
        assert_eq!(
            harness.network.journal(),
            vec![
                Interaction::LinkCheck { ready: true },
                Interaction::Establish {
                    transport_id: 1,
                    token: token.clone(),
                },
                Interaction::Handshake {
                    transport_id: 1,
                    client_id: concat!(
                        "projects/demo-project/locations/us-central1/",
                        "registries/sensors/devices/sensor-7"
                    )
                    .to_string(),
                    username: "unused".to_string(),
                    password: token,
                },
                Interaction::Subscribe {
                    transport_id: 1,
                    topic: "/devices/sensor-7/config".to_string(),
                },
                Interaction::Subscribe {
                    transport_id: 1,
                    topic: "/devices/sensor-7/commands/#".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_connect_is_idempotent_when_connected() {
        let mut harness = Harness::synced(settings());
        harness.session.connect().unwrap();
        harness.network.clear_journal();

        harness.session.connect().unwrap();

        assert!(harness.network.journal().is_empty());
        assert!(harness.session.is_connected());
    }

    #[test]
    fn test_connect_fails_at_credential_step_with_untrusted_clock() {
        let mut harness = Harness::new(settings());

        let err = harness.session.connect().unwrap_err();

        assert_eq!(err.step(), ConnectStep::Credential);
        assert!(matches!(
            err,
            ConnectError::Credential(CredentialError::UntrustedClock)
        ));
        assert_eq!(harness.session.state(), SessionState::Disconnected);
        assert_eq!(harness.network.count(is_establish), 0);
    }

    #[test]
    fn test_link_wait_blocks_until_ready() {
        let mut harness = Harness::synced(settings());
        harness.network.link_down_for(3);

        harness.session.connect().unwrap();

        let checks = harness
            .network
            .count(|i| matches!(i, Interaction::LinkCheck { .. }));
        assert_eq!(checks, 4);
        assert!(harness.session.is_connected());
    }

    #[test]
    fn test_bounded_link_wait_reports_link_down() {
        let mut harness = Harness::synced(SessionSettings {
            link_wait: LinkWait {
                poll_interval: Duration::ZERO,
                max_attempts: Some(2),
            },
            ..settings()
        });
        harness.network.link_down_for(5);

        let err = harness.session.connect().unwrap_err();

        assert!(matches!(err, ConnectError::LinkDown { attempts: 2 }));
        assert_eq!(err.step(), ConnectStep::Link);
        assert_eq!(harness.session.state(), SessionState::Disconnected);
        assert!(harness.session.credential().is_none());
    }

    #[test]
    fn test_transport_failure_then_retry_reuses_credential() {
        let mut harness = Harness::synced(settings());
        harness.network.fail_next_establish(1);

        let err = harness.session.connect().unwrap_err();
        assert_eq!(err.step(), ConnectStep::Transport);
        assert_eq!(harness.session.state(), SessionState::Disconnected);
        let first_token = harness.session.credential().unwrap().token().to_string();

        harness.advance(60);
        harness.session.connect().unwrap();

        assert_eq!(harness.session.credential().unwrap().token(), first_token);
    }

    #[test]
    fn test_handshake_failure_is_reported() {
        let mut harness = Harness::synced(settings());
        harness.network.fail_next_handshake(1);

        let err = harness.session.connect().unwrap_err();

        assert_eq!(err.step(), ConnectStep::Handshake);
        assert_eq!(harness.session.state(), SessionState::Disconnected);
        assert!(harness.session.connect().is_ok());
    }

    #[test]
    fn test_subscribe_failure_tears_down_transport() {
        let mut harness = Harness::synced(settings());
        harness.network.fail_next_subscribe(1);

        let err = harness.session.connect().unwrap_err();

        assert!(matches!(
            err,
            ConnectError::Subscribe { ref topic, .. } if topic == "/devices/sensor-7/config"
        ));
        assert_eq!(
            harness
                .network
                .count(|i| matches!(i, Interaction::Disconnect { transport_id: 1 })),
            1
        );
        assert_eq!(harness.session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_subscriptions_can_be_disabled() {
        let mut harness = Harness::synced(SessionSettings {
            subscribe_config: false,
            subscribe_commands: false,
            ..settings()
        });

        harness.session.connect().unwrap();

        assert_eq!(
            harness
                .network
                .count(|i| matches!(i, Interaction::Subscribe { .. })),
            0
        );
    }

    #[test]
    fn test_publish_before_connect_has_no_side_effect() {
        let mut harness = Harness::synced(settings());

        let result = harness.session.publish(Some("status"), b"LAN: 99 db");

        assert_eq!(result, Err(PublishError::NotConnected));
        assert!(harness.network.journal().is_empty());
    }

    #[test]
    fn test_publish_telemetry_and_state() {
        let mut harness = Harness::synced(settings());
        harness.session.connect().unwrap();
        harness.network.clear_journal();

        harness.session.publish(None, b"21.5").unwrap();
        harness.session.publish(Some("status"), b"ok").unwrap();
        harness.session.publish_state(b"{\"fw\":\"1.0\"}").unwrap();

        assert_eq!(
            harness.network.journal(),
            vec![
                Interaction::Publish {
                    transport_id: 1,
                    topic: "/devices/sensor-7/events".to_string(),
                    payload: b"21.5".to_vec(),
                },
                Interaction::Publish {
                    transport_id: 1,
                    topic: "/devices/sensor-7/events/status".to_string(),
                    payload: b"ok".to_vec(),
                },
                Interaction::Publish {
                    transport_id: 1,
                    topic: "/devices/sensor-7/state".to_string(),
                    payload: b"{\"fw\":\"1.0\"}".to_vec(),
                },
            ]
        );
    }

    #[test]
    fn test_invalid_subfolder_is_not_sent() {
        let mut harness = Harness::synced(settings());
        harness.session.connect().unwrap();
        harness.network.clear_journal();

        let result = harness.session.publish(Some("#"), b"x");

        assert_eq!(result, Err(PublishError::InvalidSubfolder("#".to_string())));
        assert!(harness.network.journal().is_empty());
        assert!(harness.session.is_connected());
    }

    #[test]
    fn test_publish_connection_loss_disconnects() {
        let mut harness = Harness::synced(settings());
        harness.session.connect().unwrap();
        harness
            .network
            .set_publish_error(Some(BrokerError::ConnectionLost("broken pipe".into())));

        let result = harness.session.publish(None, b"x");

        assert!(matches!(result, Err(PublishError::Broker(_))));
        assert_eq!(harness.session.state(), SessionState::Disconnected);
        assert_eq!(harness.session.publish(None, b"x"), Err(PublishError::NotConnected));
    }

    #[test]
    fn test_publish_rejection_keeps_session() {
        let mut harness = Harness::synced(settings());
        harness.session.connect().unwrap();
        harness
            .network
            .set_publish_error(Some(BrokerError::Rejected("payload too large".into())));

        assert!(harness.session.publish(None, b"x").is_err());
        assert!(harness.session.is_connected());
    }

    #[test]
    fn test_transport_loss_then_reconnect() {
        let mut harness = Harness::synced(settings());
        harness.session.connect().unwrap();

        harness.network.drop_connection();
        assert_eq!(harness.session.maintain().unwrap(), Maintenance::SessionLost);
        assert_eq!(harness.session.state(), SessionState::Disconnected);

        harness.session.connect().unwrap();
        assert!(harness.session.is_connected());
        assert_eq!(harness.network.count(is_establish), 2);
    }

    #[test]
    fn test_recoverable_poll_error_keeps_session() {
        let mut harness = Harness::synced(settings());
        harness.session.connect().unwrap();
        harness
            .network
            .fail_next_poll(BrokerError::Protocol("unexpected packet".into()));

        assert_eq!(harness.session.maintain().unwrap(), Maintenance::Healthy);
        assert!(harness.session.is_connected());
    }

    #[test]
    fn test_maintain_while_disconnected_is_idle() {
        let mut harness = Harness::synced(settings());

        assert_eq!(harness.session.maintain().unwrap(), Maintenance::Idle);
        assert!(harness.network.journal().is_empty());
    }

    #[test]
    fn test_maintain_healthy_before_margin() {
        let mut harness = Harness::synced(settings());
        harness.session.connect().unwrap();

        harness.advance(3299);
        assert_eq!(harness.session.maintain().unwrap(), Maintenance::Healthy);
        assert_eq!(harness.network.count(is_establish), 1);
    }

    #[test]
    fn test_refresh_by_reconnect_inside_margin() {
        let mut harness = Harness::synced(settings());
        harness.session.connect().unwrap();
        let first = harness.session.credential().unwrap().clone();

        harness.advance(3300);
        assert_eq!(harness.session.maintain().unwrap(), Maintenance::Refreshed);

        let second = harness.session.credential().unwrap();
        assert!(harness.session.is_connected());
        assert_eq!(second.issued_at(), BOOT_TIME + 3300);
        assert_ne!(second.token(), first.token());
        assert_eq!(
            harness
                .network
                .count(|i| matches!(i, Interaction::Disconnect { transport_id: 1 })),
            1
        );
        assert_eq!(harness.network.count(is_establish), 2);
    }

    #[test]
    fn test_refresh_by_reauthentication_keeps_transport() {
        let mut harness = Harness::synced(SessionSettings {
            refresh_strategy: RefreshStrategy::Reauthenticate,
            ..settings()
        });
        harness.network.set_reauth_supported(true);
        harness.session.connect().unwrap();

        harness.advance(3400);
        assert_eq!(harness.session.maintain().unwrap(), Maintenance::Refreshed);

        let token = harness.session.credential().unwrap().token().to_string();
        assert!(harness.network.journal().contains(&Interaction::Reauthenticate {
            transport_id: 1,
            password: token,
        }));
        assert_eq!(harness.network.count(is_establish), 1);
        assert!(harness.session.is_connected());
    }

    #[test]
    fn test_unsupported_reauthentication_falls_back_to_reconnect() {
        let mut harness = Harness::synced(SessionSettings {
            refresh_strategy: RefreshStrategy::Reauthenticate,
            ..settings()
        });
        harness.session.connect().unwrap();

        harness.advance(3400);
        assert_eq!(harness.session.maintain().unwrap(), Maintenance::Refreshed);

        let credential = harness.session.credential().unwrap();
        assert_eq!(credential.issued_at(), BOOT_TIME + 3400);
        assert_eq!(harness.network.count(is_establish), 2);

        // The fallback reconnect presents the credential issued for re-auth
        let token = credential.token().to_string();
        assert!(harness.network.journal().contains(&Interaction::Establish {
            transport_id: 2,
            token,
        }));
    }

    #[test]
    fn test_never_stays_connected_past_expiry() {
        let mut harness = Harness::synced(settings());
        harness.session.connect().unwrap();
        harness.network.fail_next_establish(1);

        harness.advance(4000);
        let err = harness.session.maintain().unwrap_err();

        assert_eq!(err.step(), ConnectStep::Transport);
        assert_eq!(harness.session.state(), SessionState::Disconnected);
        let now = harness.clock.now().unwrap();
        assert!(!harness.session.credential().unwrap().is_expired(now));
    }

    #[test]
    fn test_publish_on_expired_credential_tears_down() {
        let mut harness = Harness::synced(settings());
        harness.session.connect().unwrap();
        harness.network.clear_journal();

        harness.advance(7200);
        assert_eq!(harness.session.state(), SessionState::Connected);
        assert!(!harness.session.is_connected());

        let err = harness.session.publish(None, b"late").unwrap_err();

        assert!(matches!(err, PublishError::NotConnected));
        assert_eq!(harness.session.state(), SessionState::Disconnected);
        assert_eq!(
            harness.network.journal(),
            vec![Interaction::Disconnect { transport_id: 1 }]
        );
        let last = harness.session.history().last().unwrap();
        assert_eq!(last.reason, "credential expired");
    }

    #[test]
    fn test_state_report_on_expired_credential_is_refused() {
        let mut harness = Harness::synced(settings());
        harness.session.connect().unwrap();
        harness.advance(3600);

        let err = harness.session.publish_state(b"{}").unwrap_err();

        assert!(matches!(err, PublishError::NotConnected));
        assert_eq!(harness.session.state(), SessionState::Disconnected);
        assert_eq!(
            harness
                .network
                .count(|i| matches!(i, Interaction::Publish { .. })),
            0
        );
    }

    #[test]
    fn test_connect_replaces_expired_session() {
        let mut harness = Harness::synced(settings());
        harness.session.connect().unwrap();
        harness.advance(7200);

        harness.session.connect().unwrap();

        assert!(harness.session.is_connected());
        assert_eq!(harness.network.count(is_establish), 2);
        let now = harness.clock.now().unwrap();
        assert_eq!(harness.session.credential().unwrap().issued_at(), now);
    }

    #[test]
    fn test_inbound_messages_reach_handler() {
        let mut harness = Harness::synced(settings());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        harness
            .session
            .set_message_handler(Box::new(move |topic: &str, payload: &[u8]| {
                sink.lock()
                    .unwrap()
                    .push((topic.to_string(), payload.to_vec()));
            }));
        harness.session.connect().unwrap();

        harness
            .network
            .inject_message("/devices/sensor-7/config", b"{\"interval\":30}");
        harness.session.maintain().unwrap();

        assert_eq!(
            received.lock().unwrap().as_slice(),
            &[(
                "/devices/sensor-7/config".to_string(),
                b"{\"interval\":30}".to_vec()
            )]
        );
    }

    #[test]
    fn test_explicit_disconnect_keeps_credential() {
        let mut harness = Harness::synced(settings());
        harness.session.connect().unwrap();

        harness.session.disconnect();

        assert_eq!(harness.session.state(), SessionState::Disconnected);
        assert!(harness.session.credential().is_some());
        assert_eq!(
            harness
                .network
                .count(|i| matches!(i, Interaction::Disconnect { .. })),
            1
        );

        harness.session.disconnect();
        assert_eq!(
            harness
                .network
                .count(|i| matches!(i, Interaction::Disconnect { .. })),
            1
        );
    }

    #[test]
    fn test_history_records_transitions() {
        let mut harness = Harness::synced(settings());
        harness.network.fail_next_handshake(1);
        let _ = harness.session.connect();
        harness.session.connect().unwrap();

        let states: Vec<(SessionState, SessionState)> = harness
            .session
            .history()
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            states,
            vec![
                (SessionState::Disconnected, SessionState::Connecting),
                (SessionState::Connecting, SessionState::Disconnected),
                (SessionState::Disconnected, SessionState::Connecting),
                (SessionState::Connecting, SessionState::Connected),
            ]
        );
        let failure = harness.session.history().nth(1).unwrap();
        assert_eq!(failure.reason, "broker handshake step failed");
        assert_eq!(failure.at, Some(BOOT_TIME));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut harness = Harness::synced(settings());
        for _ in 0..40 {
            harness.session.connect().unwrap();
            harness.session.disconnect();
        }

        assert_eq!(harness.session.history().count(), MAX_HISTORY_SIZE);
    }
}
