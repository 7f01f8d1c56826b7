use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::RetryError;

/// Trait defining backoff behavior
#[async_trait]
pub trait Backoff: Send + Sync {
    /// Delay before the given attempt; attempt 0 never waits
    fn next_delay(&self, attempt: u32) -> Duration;

    /// Sleep for `next_delay(attempt)` unless cancelled first
    async fn wait(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), RetryError> {
        let delay = self.next_delay(attempt);
        if delay.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(RetryError::Interrupted),
        }
    }
}

/// Exponential backoff, `min(initial * multiplier^attempt, max)`, with optional jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoffBuilder::default().build()
    }
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    /// Create a new builder for ExponentialBackoff
    pub fn builder() -> ExponentialBackoffBuilder {
        ExponentialBackoffBuilder::default()
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_millis() as f64;
        let max = self.max_delay.as_millis() as f64;

        // powi saturates to infinity for large attempts, min() brings it back
        let exp_delay = base * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_delay = exp_delay.min(max);

        let jitter = if self.jitter_factor > 0.0 {
            let range = capped_delay * self.jitter_factor;
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };

        let final_delay = (capped_delay + jitter).clamp(0.0, max);

        trace!(
            attempt = attempt,
            base_delay_ms = capped_delay,
            jitter_ms = jitter,
            final_delay_ms = final_delay,
            "Calculated backoff delay"
        );

        Duration::from_millis(final_delay as u64)
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        self.calculate_delay(attempt)
    }
}

/// Builder for ExponentialBackoff
#[derive(Debug)]
pub struct ExponentialBackoffBuilder {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl Default for ExponentialBackoffBuilder {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl ExponentialBackoffBuilder {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter_factor: self.jitter_factor,
        }
    }
}
