use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ProxyError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub min_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
    /// When set, only network failures and upstream statuses in this list are retried.
    /// When unset, every error is retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_status_codes: Option<Vec<u16>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff_seconds: 2,
            max_backoff_seconds: 10,
            retry_status_codes: None,
        }
    }
}

/// Runs an upstream call with bounded exponential backoff between attempts.
#[derive(Clone, Debug, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Wait before the retry following failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let seconds = self
            .config
            .min_backoff_seconds
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_backoff_seconds);
        Duration::from_secs(seconds)
    }

    pub fn is_retryable(&self, err: &ProxyError) -> bool {
        let Some(codes) = self.config.retry_status_codes.as_ref() else {
            return true;
        };
        if let Some(status) = err.upstream_status() {
            return codes.contains(&status.as_u16());
        }
        err.is_network()
    }

    /// Invokes `call` with the 1-based attempt number until it succeeds, a
    /// non-retryable error occurs, or attempts run out. The last error is
    /// returned unchanged.
    pub async fn execute<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            let err = match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= max_attempts || !self.is_retryable(&err) {
                return Err(err);
            }

            let delay = self.backoff(attempt);
            tracing::warn!(
                attempt,
                max_attempts,
                delay_secs = delay.as_secs(),
                error = %err,
                "upstream call failed; retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
