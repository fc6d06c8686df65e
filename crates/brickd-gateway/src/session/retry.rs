//! Reconnection backoff

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Decides how long to wait before each reconnection attempt
pub trait RetryPolicy: Send + Sync {
    /// Delay before attempt `attempt` (starting at 0), or `None` to give up
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Doubling (or `multiplier`-ing) delay, capped at `max_delay`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 0 = retry forever
    pub max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ExponentialBackoff {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
            max_attempts: config.max_attempts,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts > 0 && attempt >= self.max_attempts {
            return None;
        }
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Some(Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64())))
    }
}
