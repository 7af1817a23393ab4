//! Delivery retry policy.

use std::{future::Future, time::Duration};

use {
    tgrelay_config::RelaySettings,
    tgrelay_platform::{Error as PlatformError, ErrorClass},
    tracing::warn,
};

/// Result of a call driven by [`RetryPolicy::run`].
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// Non-retryable for this message/target.
    Terminal(PlatformError),
    /// Every attempt failed with a retryable error.
    Exhausted(PlatformError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    /// Added to every platform-signaled wait.
    pub wait_buffer: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            attempts: settings.retry_attempts.max(1),
            base_delay: Duration::from_secs(settings.retry_delay_secs),
            wait_buffer: Duration::from_secs(settings.flood_wait_extra_delay_secs),
        }
    }

    /// Backoff before retrying after generic failure number `attempt`
    /// (zero-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Run `call` until it succeeds, fails terminally, or the attempts are
    /// used up. Rate-limit waits count as attempts.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Attempt<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let mut attempt = 0u32;
        loop {
            let err = match call().await {
                Ok(value) => return Attempt::Done(value),
                Err(err) => err,
            };
            let class = err.class();
            if class == ErrorClass::Terminal {
                return Attempt::Terminal(err);
            }
            if attempt + 1 >= self.attempts {
                warn!(
                    operation,
                    attempts = self.attempts,
                    error = %err,
                    "retries exhausted"
                );
                return Attempt::Exhausted(err);
            }

            let delay = match class {
                ErrorClass::Wait(wait) => wait + self.wait_buffer,
                _ => self.backoff(attempt),
            };
            warn!(
                operation,
                attempt = attempt + 1,
                max_attempts = self.attempts,
                delay_secs = delay.as_secs(),
                error = %err,
                "delivery failed, waiting before retry"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
