// ErrorThrottler: exponential backoff (1s to 60s) between retries of
// control-plane calls.

use crate::errors::AgentError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Each call to `increment_and_wait` doubles the delay (capped at 60s).
/// Calling `reset` returns the delay to 1s.
#[derive(Debug, Clone)]
pub struct ErrorThrottler {
    current_delay: Duration,
}

impl ErrorThrottler {
    pub fn new() -> Self {
        Self {
            current_delay: MIN_BACKOFF,
        }
    }

    pub fn reset(&mut self) {
        self.current_delay = MIN_BACKOFF;
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Sleep for the current delay, then grow it.
    ///
    /// Returns `true` if the delay completed, `false` if cancelled.
    pub async fn increment_and_wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.current_delay;
        tracing::debug!("Error throttling: waiting {:.1}s before retry", delay.as_secs_f64());

        let completed = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        };
        self.increment();
        completed
    }

    pub fn increment(&mut self) {
        let next_ms = (self.current_delay.as_millis() as f64 * BACKOFF_MULTIPLIER) as u64;
        self.current_delay = Duration::from_millis(next_ms).min(MAX_BACKOFF);
    }
}

impl Default for ErrorThrottler {
    fn default() -> Self {
        Self::new()
    }
}

/// How many times [`retry`] calls the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempts {
    /// Keep trying retryable errors while the cancellation scope is alive.
    Unlimited,
    Limited(u32),
    /// Keep trying on every error, retryable or not, until cancelled.
    UntilCancelled,
}

/// Run `operation` until it succeeds, fails non-retryably, runs out of
/// attempts or `cancel` fires. Returns the last error in the failure cases.
pub async fn retry<T, F, Fut>(
    what: &str,
    attempts: Attempts,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let mut throttler = ErrorThrottler::new();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let give_up = match attempts {
            Attempts::Unlimited => !err.is_retryable(),
            Attempts::Limited(max) => !err.is_retryable() || attempt >= max,
            Attempts::UntilCancelled => false,
        };
        if give_up {
            return Err(err);
        }

        tracing::warn!("{} failed (attempt {}): {}", what, attempt, err);
        if !throttler.increment_and_wait(cancel).await {
            return Err(err);
        }
    }
}
