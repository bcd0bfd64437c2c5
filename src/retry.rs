use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::codes;
use crate::{AppError, AppResult};

/// Per-attempt timeout with capped exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or the
    /// retry budget is spent. Timeouts surface as `timeout_code`.
    pub async fn run<T, F, Fut>(&self, step: &str, timeout_code: &str, mut op: F) -> AppResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = match tokio::time::timeout(self.timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::new(
                    timeout_code,
                    format!("{step} exceeded {} ms", self.timeout.as_millis()),
                )),
            };
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) if !is_retryable(&err) => return Err(err),
                Err(err) => err,
            };
            if attempt >= self.max_retries {
                return Err(AppError::new(
                    codes::EXHAUSTED_RETRIES,
                    format!("{step} failed after {} attempts", attempt + 1),
                )
                .with_context("step", step)
                .with_context("attempts", (attempt + 1).to_string())
                .with_cause(err));
            }
            let delay = self.backoff_for(attempt);
            warn!(
                target: "tableshift",
                event = "step_retry",
                step,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Timeouts, busy/locked databases, and pool or IO errors.
pub fn is_retryable(err: &AppError) -> bool {
    let code = err.code();
    code == codes::BATCH_TIMEOUT
        || matches!(code, "Sqlite/5" | "Sqlite/6" | "Sqlite/261" | "Sqlite/517" | "Sqlite/773")
        || code.starts_with("SQLX/POOL")
        || code.starts_with("IO/")
}
