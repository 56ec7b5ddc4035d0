//! Retries for gateway calls that fail transiently.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use ledgersync_common::Result;

/// Ceiling for a single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Delay schedule between gateway attempts. The delay doubles on every
/// retry up to [`MAX_BACKOFF`] and is spread by +/- 25%.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(200),
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self.initial_delay.saturating_mul(factor).min(MAX_BACKOFF);

        if self.jitter {
            delay.mul_f64(0.75 + rand::random::<f64>() * 0.5)
        } else {
            delay
        }
    }
}

/// Runs gateway calls under a [`Backoff`].
///
/// Only transient failures (`Error::is_transient`) are retried. A rejected
/// commit or a missing entity goes straight back to the coordinator.
#[derive(Debug, Clone)]
pub struct GatewayRetry {
    backoff: Backoff,
}

impl GatewayRetry {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff }
    }

    pub async fn run<F, Fut, T>(&self, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            let err = match call().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!("Gateway call succeeded after {} retries", retries);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_transient() || retries >= self.backoff.max_retries {
                if err.is_transient() {
                    warn!("Gateway unreachable after {} attempts: {}", retries + 1, err);
                }
                return Err(err);
            }

            let delay = self.backoff.delay_for_attempt(retries);
            retries += 1;
            debug!("Gateway call failed ({}), retry {} in {:?}", err, retries, delay);
            sleep(delay).await;
        }
    }
}
