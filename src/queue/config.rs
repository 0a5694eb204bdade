//! Timing configuration shared by queue backends and the dispatcher.

use std::time::Duration;

/// Default base delay for retried keys.
pub const DEFAULT_BACKOFF_PERIOD: Duration = Duration::from_secs(30);
/// Default upper bound on the retry delay.
pub const DEFAULT_MAXIMUM_BACKOFF_PERIOD: Duration = Duration::from_secs(10 * 60);
/// Default lease heartbeat interval.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Lease and retry timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Base delay applied per failed attempt.
    pub backoff_period: Duration,
    /// Cap on the computed retry delay.
    pub maximum_backoff_period: Duration,
    /// How often an owned key's lease is renewed.
    pub refresh_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff_period: DEFAULT_BACKOFF_PERIOD,
            maximum_backoff_period: DEFAULT_MAXIMUM_BACKOFF_PERIOD,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

impl QueueConfig {
    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    /// Sets the base and maximum backoff.
    #[must_use]
    pub const fn with_backoff(mut self, period: Duration, maximum: Duration) -> Self {
        self.backoff_period = period;
        self.maximum_backoff_period = maximum;
        self
    }

    /// Lease lifetime written on every renewal: three refresh intervals, so two
    /// consecutive missed heartbeats are tolerated.
    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        self.refresh_interval.saturating_mul(3)
    }

    /// Retry delay after `attempts` failed attempts:
    /// `min(backoff_period * attempts, maximum_backoff_period)`.
    #[must_use]
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        self.backoff_period
            .saturating_mul(attempts.max(1))
            .min(self.maximum_backoff_period)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh interval is zero or the maximum backoff
    /// is below the base backoff.
    pub fn validate(&self) -> Result<(), String> {
        if self.refresh_interval.is_zero() {
            return Err("refresh_interval must be greater than zero".to_string());
        }
        if self.maximum_backoff_period < self.backoff_period {
            return Err(format!(
                "maximum_backoff_period ({:?}) must be >= backoff_period ({:?})",
                self.maximum_backoff_period, self.backoff_period
            ));
        }
        Ok(())
    }
}
