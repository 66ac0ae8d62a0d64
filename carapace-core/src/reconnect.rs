//! Reconnection pacing.
//!
//! A server is never dialed again until `reconnect_time_wait` (plus a random
//! jitter) has passed since the previous attempt against it, and a server is
//! skipped once it has failed `max_reconnect_attempts` times in a row.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::options::ConnectOptions;

/// Reconnection state tracker for one reconnect episode.
///
/// # Example
///
/// ```rust
/// use carapace_core::reconnect::ReconnectState;
/// use carapace_core::options::ConnectOptions;
/// use std::time::{Duration, Instant};
///
/// let options = ConnectOptions::default()
///     .with_reconnect_time_wait(Duration::from_millis(100))
///     .with_reconnect_jitter(Duration::ZERO)
///     .with_max_reconnect_attempts(Some(3));
///
/// let reconnect = ReconnectState::new(&options);
///
/// // Never tried: no wait
/// assert_eq!(reconnect.delay_for(None, Instant::now()), Duration::ZERO);
///
/// // Just tried: wait out the remainder
/// let now = Instant::now();
/// assert_eq!(reconnect.delay_for(Some(now), now), Duration::from_millis(100));
///
/// assert!(!reconnect.exhausted(3));
/// assert!(reconnect.exhausted(4));
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectState {
    /// Minimum spacing between attempts on one server
    time_wait: Duration,
    /// Upper bound of random extra delay
    jitter: Duration,
    /// Failures tolerated per server (`None` = unlimited)
    max_attempts: Option<u32>,
    /// Attempts made in the current episode
    attempt: u32,
}

impl ReconnectState {
    /// Create a tracker from client options.
    pub fn new(options: &ConnectOptions) -> Self {
        Self {
            time_wait: options.reconnect_time_wait,
            jitter: options.reconnect_jitter,
            max_attempts: options.max_reconnect_attempts,
            attempt: 0,
        }
    }

    /// Delay before dialing a server last tried at `last_attempt`.
    pub fn delay_for(&self, last_attempt: Option<Instant>, now: Instant) -> Duration {
        let Some(last) = last_attempt else {
            return Duration::ZERO;
        };
        let elapsed = now.saturating_duration_since(last);
        if elapsed >= self.time_wait {
            return Duration::ZERO;
        }
        (self.time_wait - elapsed) + self.sample_jitter()
    }

    fn sample_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let max = self.jitter.as_millis().min(u128::from(u64::MAX)) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// True once a server with `failures` consecutive failures must be skipped.
    pub fn exhausted(&self, failures: u32) -> bool {
        match self.max_attempts {
            Some(max) => failures > max,
            None => false,
        }
    }

    /// Record one more attempt in this episode and return its number.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }
}
