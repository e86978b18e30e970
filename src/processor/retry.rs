//! Client-side retry of operations that fail with [`Error::Retry`].

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    next: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl BackoffPolicy {
    /// Create a policy from retry configuration.
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            next: config.initial_backoff,
            max: config.max_backoff,
            multiplier: config.multiplier,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = base.mul_f64(self.multiplier).min(self.max);

        if self.jitter == 0.0 {
            return base;
        }
        let factor = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor).min(self.max)
    }
}

/// Runs an operation until it stops asking to be retried.
///
/// The operation is a closure producing a fresh future per attempt. Errors
/// other than [`Error::Retry`] end the loop at once. When the total time
/// budget runs out the call fails with [`Error::Timeout`].
#[derive(Debug, Clone)]
pub struct Retrier {
    config: RetryConfig,
}

impl Retrier {
    /// Create a retrier.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` with retries.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut backoff = BackoffPolicy::new(&self.config);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let reason = match operation().await {
                Err(Error::Retry { reason }) => reason,
                other => return other,
            };

            let delay = backoff.next_delay();
            if started.elapsed() + delay > self.config.timeout {
                warn!(attempt, %reason, "Retry budget exhausted");
                return Err(Error::Timeout);
            }
            debug!(attempt, %reason, delay_ms = delay.as_millis() as u64, "Retrying");
            sleep(delay).await;
        }
    }
}
