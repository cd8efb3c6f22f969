//! Exponential backoff for transient analysis failures.

use std::time::Duration;

use rand::Rng;

use crate::config::PipelineConfig;

/// Backoff schedule for one item's analysis attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts allowed after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random `0..jitter_fraction * delay` added to each wait, within
    /// `max_delay`.
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            ..Self::default()
        }
    }

    /// Whether another attempt is allowed after `attempt` (0-indexed) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Wait before retrying after `attempt` (0-indexed) failed.
    ///
    /// `min(base * 2^attempt + jitter, max)`. A server-supplied
    /// `retry_after` wins when it is longer, still capped at `max`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = 2u32.saturating_pow(attempt);
        let backoff = self.base_delay.saturating_mul(exp).min(self.max_delay);

        let jitter_max_ms = (backoff.as_millis() as f64 * self.jitter_fraction) as u64;
        let jitter = if jitter_max_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_max_ms))
        } else {
            Duration::ZERO
        };

        let delay = backoff.saturating_add(jitter);
        let delay = match retry_after {
            Some(hint) if hint > delay => hint,
            _ => delay,
        };
        delay.min(self.max_delay)
    }
}
