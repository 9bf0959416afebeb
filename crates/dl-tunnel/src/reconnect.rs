//! Retry delay schedule for re-establishing a dropped tunnel

use std::time::Duration;

use dl_core::config::BackoffConfig;

/// Produces the delay to wait before each reconnect attempt.
///
/// Delays grow by the configured multiplier per attempt and cap at the
/// configured maximum. Random jitter is added on top so a fleet of
/// clients that lost the same server does not reconnect in lockstep.
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Start a fresh schedule from configuration
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt, advancing the schedule
    pub fn advance(&mut self) -> Duration {
        let base = self.config.initial.as_secs_f64()
            * self.config.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.config.max.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);

        let jitter = capped * self.config.jitter * rand::random::<f64>();
        Duration::from_secs_f64(capped + jitter)
    }

    /// Start over, after a connection that proved healthy
    pub fn restart(&mut self) {
        self.attempt = 0;
    }
}
