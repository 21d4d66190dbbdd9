use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: crate::settings::DEFAULT_MAX_RETRY_TURNS, base_delay: Duration::from_millis(1000) }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries, ..Self::default() }
    }

    /// `base_delay * 2^(retry-1)` for the 1-based retry number.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

/// How a single attempt ended when it did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptError {
    Canceled,
    Model(ModelError),
}

impl From<ModelError> for AttemptError {
    fn from(value: ModelError) -> Self {
        AttemptError::Model(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport<'a> {
    /// 0 for the first attempt.
    pub retry: u32,
    pub max_retries: u32,
    pub error: Option<&'a ModelError>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryError {
    #[error("canceled")]
    Canceled,
    #[error("{error}")]
    Failed { error: ModelError, retries_attempted: u32 },
}

/// Runs `attempt` until it succeeds, fails with a non-retryable error, or
/// `policy.max_retries` retries are spent. Every attempt is passed to `report`.
pub async fn run_with_retry<T, F, Fut, R>(policy: &RetryPolicy, cancel: &CancellationToken, mut report: R, mut attempt: F) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
    R: FnMut(AttemptReport<'_>),
{
    let mut retry = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Canceled);
        }
        match attempt(retry).await {
            Ok(value) => {
                report(AttemptReport { retry, max_retries: policy.max_retries, error: None });
                return Ok(value);
            }
            Err(AttemptError::Canceled) => return Err(RetryError::Canceled),
            Err(AttemptError::Model(error)) => {
                report(AttemptReport { retry, max_retries: policy.max_retries, error: Some(&error) });
                if !error.retryable || retry >= policy.max_retries {
                    debug!(retry, retryable = error.retryable, error = %error, "model attempt failed for good");
                    return Err(RetryError::Failed { error, retries_attempted: retry });
                }
                retry += 1;
                let delay = policy.delay_for(retry);
                metrics::counter!("agent_model_retries_total").increment(1);
                warn!(retry, max_retries = policy.max_retries, delay_ms = delay.as_millis() as u64, error = %error, "retrying model stream");
                if backoff(delay, cancel).await.is_err() {
                    return Err(RetryError::Canceled);
                }
            }
        }
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
pub async fn backoff(delay: Duration, cancel: &CancellationToken) -> Result<(), AttemptError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AttemptError::Canceled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
