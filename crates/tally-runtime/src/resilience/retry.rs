//! Bounded retry at the task boundary.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tally_core::TaskError;

use crate::config::RetryConfig;

type RetryPredicate = Arc<dyn Fn(&TaskError) -> bool + Send + Sync>;

/// Exponential backoff with a hard cap on attempts.
///
/// By default failures and timeouts are retried, panics are not.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_factor: f32,
    retryable: RetryPredicate,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("backoff_factor", &self.backoff_factor)
            .finish_non_exhaustive()
    }
}

fn default_retryable(error: &TaskError) -> bool {
    !matches!(error, TaskError::Panicked { .. })
}

impl RetryPolicy {
    /// One attempt, no retries.
    pub fn none() -> Self {
        Self::from_config(&RetryConfig::default())
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            backoff_factor: config.backoff_factor,
            retryable: Arc::new(default_retryable),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Replace the retryable-error predicate.
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&TaskError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Returns the final result and attempts made.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> (Result<T, TaskError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let mut attempts = 0u32;
        let retryable = self.retryable.clone();
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.backoff_factor)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize);

        let result = (|| {
            attempts += 1;
            op()
        })
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .when(move |e: &TaskError| retryable(e))
        .notify(|e: &TaskError, delay: Duration| {
            tracing::debug!(error = %e, delay = ?delay, "Retrying task");
        })
        .await;

        (result, attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
