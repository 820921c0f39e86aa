//! Async row evaluators.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tally_core::{EvaluatorError, EvaluatorOutput, RowEvaluator};

/// Trait for row evaluators that await something, typically a judge model.
///
/// # Isolation Contract
/// - MUST NOT mutate dataset state
/// - MUST NOT share mutable state with other evaluators
/// - Runs under its own timeout, separate from the task's
#[async_trait]
pub trait AsyncRowEvaluator: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(
        &self,
        input: &Value,
        output: &Value,
        expected: Option<&Value>,
    ) -> Result<EvaluatorOutput, EvaluatorError>;

    /// Timeout for one call. `None` means unbounded.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Runs a synchronous [`RowEvaluator`] in the async registry.
pub struct SyncEvaluator<E> {
    inner: E,
}

impl<E: RowEvaluator> SyncEvaluator<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<E: RowEvaluator> AsyncRowEvaluator for SyncEvaluator<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn evaluate(
        &self,
        input: &Value,
        output: &Value,
        expected: Option<&Value>,
    ) -> Result<EvaluatorOutput, EvaluatorError> {
        self.inner.evaluate(input, output, expected)
    }
}
