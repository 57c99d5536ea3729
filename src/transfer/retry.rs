//! Retry policy with exponential backoff
//!
//! Backoff is `base_delay * 2^attempt` with attempts counted from 1, so the
//! default one-second base waits 2s, 4s, 8s... In `Classified` mode only
//! transport failures are retried. `Uniform` retries every failure except
//! cancellation.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Result, TransferError};

/// Which failures are eligible for retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// Retry transport failures only (timeouts, resets, throttling, 5xx)
    #[default]
    Classified,
    /// Retry every failure kind except cancellation
    Uniform,
}

/// Decides whether a failed operation is retried and how long to wait
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    mode: RetryMode,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            mode: RetryMode::Classified,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            mode: RetryMode::Classified,
        }
    }

    pub fn with_mode(mut self, mode: RetryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn mode(&self) -> RetryMode {
        self.mode
    }

    /// Whether to make another attempt after `attempt` (1-based) failed with `error`
    pub fn should_retry(&self, error: &TransferError, attempt: u32, max_attempts: u32) -> bool {
        if attempt >= max_attempts {
            return false;
        }
        match self.mode {
            RetryMode::Classified => error.is_transient(),
            RetryMode::Uniform => !error.is_cancelled(),
        }
    }

    /// Wait before the attempt following `attempt`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Backoff sleeps end early with `Cancelled` when `cancel` fires.
    pub async fn retry<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(&e, attempt, self.max_attempts) => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "operation_retry"
                    );
                    self.pause(delay, cancel).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sleep for `delay` unless cancelled first
    pub async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
        }
    }
}
