use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};

/// Backoff used when a write loses an optimistic concurrency race
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: usize,
    pub base_millis: u64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_millis: 10,
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    pub fn with_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Total number of attempts including the first
    pub fn attempts(&self) -> usize {
        self.max_retries + 1
    }

    pub fn strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.base_millis)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_retries)
    }
}
