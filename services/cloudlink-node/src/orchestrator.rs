//! Startup sequencing and the steady-state connectivity loop.
//!
//! The orchestrator establishes trusted time before anything else, builds
//! the credential issuer and session manager from configuration, and then
//! turns the session's typed results into the boolean outcomes the node
//! loop acts on.

use cloudlink_core::{
    ClockError, ClockSynchronizer, DeviceClock, InstantClock, MonotonicClock, NodeConfig,
    TimeSource,
};
use cloudlink_crypto::{CredentialError, CredentialIssuer, CredentialPolicy};
use cloudlink_identity::{DeviceIdentity, IdentityError};
use cloudlink_session::{
    BrokerClient, Maintenance, SessionManager, SessionSettings, TransportProvider,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Startup failures. A clock failure is fatal for the node.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Time synchronization failed after {attempts} attempts: {source}")]
    Clock {
        attempts: u32,
        #[source]
        source: ClockError,
    },

    #[error("Invalid device identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("Credential setup failed: {0}")]
    Credential(#[from] CredentialError),
}

/// Exponential delay between failed connect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
    retry_at: Option<Duration>,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
            retry_at: None,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay after the given number of consecutive failures:
    /// `base * 2^(failures - 1)`, capped at `max`.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Whether a connect attempt is allowed at monotonic time `now`.
    pub fn ready(&self, now: Duration) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }

    pub fn record_failure(&mut self, now: Duration) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.delay(self.failures);
        self.retry_at = Some(now + delay);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.retry_at = None;
    }
}

/// Owns the clock synchronizer and the session for one device.
pub struct Orchestrator<S, P, B>
where
    S: TimeSource,
    P: TransportProvider,
    B: BrokerClient<P::Transport>,
{
    synchronizer: ClockSynchronizer<S>,
    session: SessionManager<P, B>,
    monotonic: Arc<dyn MonotonicClock>,
    backoff: ReconnectBackoff,
    resync_interval: Option<Duration>,
    last_sync: Duration,
}

impl<S, P, B> Orchestrator<S, P, B>
where
    S: TimeSource,
    P: TransportProvider,
    B: BrokerClient<P::Transport>,
{
    /// Synchronize the clock and build the session from configuration.
    pub fn setup(
        config: &NodeConfig,
        source: S,
        provider: P,
        broker: B,
    ) -> Result<Self, SetupError> {
        Self::setup_with_monotonic(
            config,
            source,
            provider,
            broker,
            Arc::new(InstantClock::new()),
        )
    }

    /// Like [`Orchestrator::setup`] with an explicit monotonic counter.
    pub fn setup_with_monotonic(
        config: &NodeConfig,
        source: S,
        provider: P,
        broker: B,
        monotonic: Arc<dyn MonotonicClock>,
    ) -> Result<Self, SetupError> {
        let clock = Arc::new(DeviceClock::with_monotonic(
            config.clock.min_valid_epoch,
            monotonic.clone(),
        ));
        let mut synchronizer = ClockSynchronizer::new(source, clock.clone());
        Self::initial_sync(&mut synchronizer, config)?;

        let identity = DeviceIdentity::from_config(&config.device)?;
        let policy = CredentialPolicy::from_config(&config.credential)?;
        let issuer = CredentialIssuer::new(identity, policy)?;
        info!(
            client_id = %issuer.identity().client_id(),
            key_id = %issuer.key_id(),
            "Device identity loaded"
        );

        let session = SessionManager::new(
            issuer,
            clock,
            provider,
            broker,
            SessionSettings::from_config(config),
        );

        let last_sync = monotonic.elapsed();
        Ok(Self {
            synchronizer,
            session,
            monotonic,
            backoff: ReconnectBackoff::new(
                Duration::from_millis(config.broker.reconnect_base_ms),
                Duration::from_millis(config.broker.reconnect_max_ms),
            ),
            resync_interval: config.clock.resync_interval_secs.map(Duration::from_secs),
            last_sync,
        })
    }

    fn initial_sync(
        synchronizer: &mut ClockSynchronizer<S>,
        config: &NodeConfig,
    ) -> Result<(), SetupError> {
        let attempts = config.clock.sync_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match synchronizer.synchronize() {
                Ok(report) => {
                    info!(epoch_secs = report.epoch_secs, attempt, "Clock trusted");
                    return Ok(());
                }
                Err(source) if attempt >= attempts => {
                    error!(attempts, error = %source, "Time synchronization failed");
                    return Err(SetupError::Clock { attempts, source });
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Time sync attempt failed, retrying");
                    std::thread::sleep(config.clock.retry_delay());
                }
            }
        }
    }

    pub fn session(&self) -> &SessionManager<P, B> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionManager<P, B> {
        &mut self.session
    }

    pub fn clock(&self) -> &Arc<DeviceClock> {
        self.synchronizer.clock()
    }

    pub fn successful_syncs(&self) -> u64 {
        self.synchronizer.successful_syncs()
    }

    pub fn backoff(&self) -> &ReconnectBackoff {
        &self.backoff
    }

    /// Register the inbound message handler.
    pub fn on_message<F>(&mut self, handler: F)
    where
        F: FnMut(&str, &[u8]) + Send + 'static,
    {
        self.session.set_message_handler(Box::new(handler));
    }

    /// Connect unless already connected or still backing off.
    pub fn connect(&mut self) -> bool {
        if self.session.is_connected() {
            return true;
        }

        let now = self.monotonic.elapsed();
        if !self.backoff.ready(now) {
            debug!(failures = self.backoff.failures(), "Reconnect backoff active");
            return false;
        }

        match self.session.connect() {
            Ok(()) => {
                self.backoff.reset();
                true
            }
            Err(e) => {
                // The attempt itself may have waited on the link
                let delay = self.backoff.record_failure(self.monotonic.elapsed());
                error!(
                    step = %e.step(),
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Connect failed"
                );
                false
            }
        }
    }

    /// Publish to the default telemetry topic.
    pub fn publish_telemetry(&mut self, payload: &[u8]) -> bool {
        self.publish(None, payload)
    }

    /// Publish to a telemetry subfolder.
    pub fn publish_telemetry_to(&mut self, subfolder: &str, payload: &[u8]) -> bool {
        self.publish(Some(subfolder), payload)
    }

    fn publish(&mut self, subfolder: Option<&str>, payload: &[u8]) -> bool {
        match self.session.publish(subfolder, payload) {
            Ok(()) => true,
            Err(e) => {
                error!(subfolder = subfolder.unwrap_or(""), error = %e, "Telemetry publish failed");
                false
            }
        }
    }

    pub fn publish_state(&mut self, payload: &[u8]) -> bool {
        match self.session.publish_state(payload) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "State publish failed");
                false
            }
        }
    }

    /// One pass of the node loop: optional clock re-sync, session upkeep,
    /// and reconnection when the session is down. Returns whether the
    /// session is connected afterwards.
    pub fn maintain(&mut self) -> bool {
        self.maybe_resync();

        match self.session.maintain() {
            Ok(Maintenance::Healthy | Maintenance::Refreshed) => true,
            Ok(Maintenance::Idle | Maintenance::SessionLost) => self.connect(),
            Err(e) => {
                let delay = self.backoff.record_failure(self.monotonic.elapsed());
                error!(
                    step = %e.step(),
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Credential refresh failed"
                );
                false
            }
        }
    }

    fn maybe_resync(&mut self) {
        let Some(interval) = self.resync_interval else {
            return;
        };
        let now = self.monotonic.elapsed();
        if now.saturating_sub(self.last_sync) < interval {
            return;
        }

        self.last_sync = now;
        match self.synchronizer.synchronize() {
            Ok(report) => debug!(
                correction_secs = report.correction_secs.unwrap_or(0),
                "Clock re-synchronized"
            ),
            Err(e) => warn!(error = %e, "Clock re-sync failed, keeping current time"),
        }
    }
}
