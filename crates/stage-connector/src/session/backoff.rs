//! Reconnect delay policies

use std::time::Duration;

use stage_core::config::BackoffConfig;

/// Decides how long to wait before each reconnect attempt
pub trait BackoffPolicy: Send + Sync {
    /// Delay before the next attempt; advances the policy
    fn next_delay(&mut self) -> Duration;

    /// Called once a session becomes active again
    fn reset(&mut self);
}

/// Capped exponential backoff with additive jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay after a reset
    initial: Duration,
    /// Current delay
    current: Duration,
    /// Maximum delay, jitter included
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial,
            max,
            multiplier,
            jitter,
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        // Out-of-range products (overflow, NaN) saturate at the cap
        let next = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        let jitter = Duration::try_from_secs_f64(jitter_amount).unwrap_or_default();
        std::cmp::min(delay.saturating_add(jitter), self.max)
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// The same delay every time
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl BackoffPolicy for FixedBackoff {
    fn next_delay(&mut self) -> Duration {
        self.0
    }

    fn reset(&mut self) {}
}
