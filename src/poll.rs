//! Poll-until-condition combinator shared by every blocking wait in the engine.
use crate::{Error, Result};
use std::{future::Future, time::Duration};
use tokio::time::{sleep, Instant};
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// One second interval, used by the reconcilers and delete confirmation
    pub fn every_second(timeout: Duration) -> Self {
        Self::new(Duration::from_secs(1), timeout)
    }
}

/// Call `check` every `interval` until it yields a value.
///
/// The first check runs immediately. An error from `check` aborts the wait.
/// Once `timeout` has elapsed without a value, returns [`Error::Timeout`].
pub async fn poll_until<T, F, Fut>(what: &str, config: &PollConfig, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + config.timeout;
    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if Instant::now() + config.interval > deadline {
            return Err(Error::Timeout {
                what: what.to_string(),
                after: config.timeout,
            });
        }
        trace!("{} not ready, checking again in {:?}", what, config.interval);
        sleep(config.interval).await;
    }
}
