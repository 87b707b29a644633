//! Trusted wall-clock time for credential issuance.
//!
//! A device boots with no idea what time it is. [`DeviceClock`] starts
//! [`ClockState::Unset`] and only reports wall-clock time after a
//! [`ClockSynchronizer`] has anchored it to a reading from a [`TimeSource`]
//! that passed the sanity bound. From then on the current time is the
//! anchor plus the monotonic time elapsed since synchronization:
//!
//! ```text
//! now = epoch_secs + (monotonic_now - monotonic_at_sync)
//! ```
//!
//! The clock is shared by reference (`Arc<DeviceClock>`) rather than living
//! in a process global, so tests drive it with a [`ManualClock`].

use crate::error::ClockError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Monotonic counter the wall-clock offset is applied to.
pub trait MonotonicClock: Send + Sync + fmt::Debug {
    /// Time elapsed since an arbitrary fixed origin.
    fn elapsed(&self) -> Duration;
}

/// Monotonic clock backed by [`Instant`].
#[derive(Debug)]
pub struct InstantClock {
    origin: Instant,
}

impl InstantClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for InstantClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for InstantClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Monotonic clock advanced by hand, for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(by.as_nanos().min(u64::MAX as u128) as u64, Ordering::SeqCst);
    }
}

impl MonotonicClock for ManualClock {
    fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Wall-clock state of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    /// No successful synchronization yet
    Unset,
    /// Anchored to a sane reading from a time source
    Trusted {
        /// Unix seconds reported by the time source
        epoch_secs: u64,
        /// Monotonic reading taken when the anchor was applied
        monotonic_at_sync: Duration,
    },
}

/// Process-wide device clock. Written by synchronization, read by every
/// time-dependent operation.
#[derive(Debug)]
pub struct DeviceClock {
    monotonic: Arc<dyn MonotonicClock>,
    state: RwLock<ClockState>,
    min_valid_epoch: u64,
}

impl DeviceClock {
    /// Create an unset clock backed by [`InstantClock`].
    pub fn new(min_valid_epoch: u64) -> Self {
        Self::with_monotonic(min_valid_epoch, Arc::new(InstantClock::new()))
    }

    /// Create an unset clock backed by the given monotonic counter.
    pub fn with_monotonic(min_valid_epoch: u64, monotonic: Arc<dyn MonotonicClock>) -> Self {
        Self {
            monotonic,
            state: RwLock::new(ClockState::Unset),
            min_valid_epoch,
        }
    }

    pub fn state(&self) -> ClockState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_trusted(&self) -> bool {
        matches!(self.state(), ClockState::Trusted { .. })
    }

    pub fn min_valid_epoch(&self) -> u64 {
        self.min_valid_epoch
    }

    /// Current Unix time in seconds, or `None` while the clock is unset.
    pub fn now(&self) -> Option<u64> {
        match self.state() {
            ClockState::Unset => None,
            ClockState::Trusted {
                epoch_secs,
                monotonic_at_sync,
            } => {
                let since_sync = self.monotonic.elapsed().saturating_sub(monotonic_at_sync);
                Some(epoch_secs.saturating_add(since_sync.as_secs()))
            }
        }
    }

    /// Current Unix time in seconds, failing while the clock is unset.
    pub fn try_now(&self) -> Result<u64, ClockError> {
        self.now().ok_or(ClockError::NotSynchronized)
    }

    /// Anchor the clock to `epoch_secs` if it passes the sanity bound.
    ///
    /// A rejected reading leaves the previous state untouched.
    pub fn apply(&self, epoch_secs: u64) -> Result<(), ClockError> {
        if epoch_secs < self.min_valid_epoch {
            return Err(ClockError::BehindSanityBound {
                observed: epoch_secs,
                minimum: self.min_valid_epoch,
            });
        }

        let anchored = ClockState::Trusted {
            epoch_secs,
            monotonic_at_sync: self.monotonic.elapsed(),
        };
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = anchored;
        Ok(())
    }
}

/// External time source, e.g. an NTP server.
pub trait TimeSource {
    /// Perform one round trip and return the reported Unix time in seconds.
    fn fetch_epoch(&mut self) -> Result<u64, ClockError>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String {
        "time source".to_string()
    }
}

impl<T: TimeSource + ?Sized> TimeSource for Box<T> {
    fn fetch_epoch(&mut self) -> Result<u64, ClockError> {
        (**self).fetch_epoch()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Outcome of a successful synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub epoch_secs: u64,
    /// Seconds the clock moved, when it was already trusted
    pub correction_secs: Option<i64>,
}

/// Establishes trusted time on a [`DeviceClock`] from a [`TimeSource`].
#[derive(Debug)]
pub struct ClockSynchronizer<S> {
    source: S,
    clock: Arc<DeviceClock>,
    successful_syncs: u64,
}

impl<S: TimeSource> ClockSynchronizer<S> {
    pub fn new(source: S, clock: Arc<DeviceClock>) -> Self {
        Self {
            source,
            clock,
            successful_syncs: 0,
        }
    }

    pub fn clock(&self) -> &Arc<DeviceClock> {
        &self.clock
    }

    pub fn successful_syncs(&self) -> u64 {
        self.successful_syncs
    }

    /// Fetch the time once and apply it to the clock.
    ///
    /// Fails if the round trip fails or the reading is behind the sanity
    /// bound. Safe to call again for periodic re-sync; a failure never
    /// downgrades a clock that is already trusted.
    pub fn synchronize(&mut self) -> Result<SyncReport, ClockError> {
        let source = self.source.describe();
        debug!(source = %source, "Requesting time");

        let epoch_secs = self.source.fetch_epoch().map_err(|e| {
            warn!(source = %source, error = %e, "Time sync round trip failed");
            e
        })?;

        let previous = self.clock.now();
        if let Err(e) = self.clock.apply(epoch_secs) {
            warn!(
                source = %source,
                observed = epoch_secs,
                minimum = self.clock.min_valid_epoch(),
                "Time sync failed sanity check, time is behind"
            );
            return Err(e);
        }

        self.successful_syncs += 1;
        let correction_secs = previous.map(|p| epoch_secs as i64 - p as i64);
        info!(
            source = %source,
            epoch_secs,
            correction_secs = correction_secs.unwrap_or(0),
            "Time sync sanity check passed"
        );

        Ok(SyncReport {
            epoch_secs,
            correction_secs,
        })
    }
}
