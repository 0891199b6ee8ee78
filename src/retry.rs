//! Reconnect policy and timeout utilities.
//!
//! The helpers in this module are transport-agnostic: the stream scheduler
//! asks the policy how long to back off and whether another attempt is
//! allowed, and wraps dial/auth steps in [`with_timeout`].

use std::future::Future;
use std::time::Duration;

use crate::stream::error::TickerError;

/// Default values applied by [`ReconnectPolicy::default`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReconnectDefaults;

impl ReconnectDefaults {
    pub const MAX_ATTEMPTS: u32 = 300;
    pub const MAX_DELAY: Duration = Duration::from_secs(60);
    /// `max_delay` can't be configured below this value.
    pub const MIN_MAX_DELAY: Duration = Duration::from_secs(5);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(7);
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
}

/// Policy controlling reconnect attempts and exponential backoff behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect automatically after a failed dial or a dropped session.
    pub auto_reconnect: bool,
    /// Attempts allowed before the give-up callback fires.
    pub max_attempts: u32,
    /// Upper bound for exponential backoff delay growth.
    max_delay: Duration,
    /// Timeout for the transport handshake and the authentication reply.
    pub connect_timeout: Duration,
    pub(crate) heartbeat_interval: Duration,
}

impl ReconnectPolicy {
    /// Sets the backoff ceiling.
    ///
    /// Fails with [`TickerError::Config`] when `max_delay` is below
    /// [`ReconnectDefaults::MIN_MAX_DELAY`].
    pub fn with_max_delay(mut self, max_delay: Duration) -> Result<Self, TickerError> {
        if max_delay < ReconnectDefaults::MIN_MAX_DELAY {
            return Err(TickerError::Config(format!(
                "reconnect max delay can't be less than {}ms",
                ReconnectDefaults::MIN_MAX_DELAY.as_millis()
            )));
        }
        self.max_delay = max_delay;
        Ok(self)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Returns the configured backoff ceiling.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Interval between heartbeat frames on a live session.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Computes the delay to apply before reconnect attempt `attempt`.
    ///
    /// The delay is `2^attempt` seconds clamped to the configured ceiling.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        std::cmp::min(Duration::from_secs(secs), self.max_delay)
    }

    /// Returns `true` once `attempt` is past the configured ceiling.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: ReconnectDefaults::MAX_ATTEMPTS,
            max_delay: ReconnectDefaults::MAX_DELAY,
            connect_timeout: ReconnectDefaults::CONNECT_TIMEOUT,
            heartbeat_interval: ReconnectDefaults::HEARTBEAT_INTERVAL,
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}
