//! Evaluator registry.
//!
//! Holds the ordered row evaluators for a run and executes all of them on
//! one record. A failing, panicking or timed-out evaluator yields an error
//! for its own cell only.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tally_core::{panic_message, EvaluatorError, EvaluatorOutput, Record, RegistryError, RowEvaluator};

use crate::evaluator::{AsyncRowEvaluator, SyncEvaluator};

/// One evaluator's raw outcome on one record, before metric-kind
/// normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvaluation {
    pub evaluator_name: String,
    pub outcome: Result<EvaluatorOutput, EvaluatorError>,
}

/// Ordered, name-unique row evaluators.
#[derive(Default, Clone)]
pub struct EvaluatorRegistry {
    evaluators: Vec<Arc<dyn AsyncRowEvaluator>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an evaluator. A name collision is rejected.
    pub fn register(&mut self, evaluator: Arc<dyn AsyncRowEvaluator>) -> Result<(), RegistryError> {
        let name = evaluator.name();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.evaluators.iter().any(|e| e.name() == name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        self.evaluators.push(evaluator);
        Ok(())
    }

    pub fn register_sync<E>(&mut self, evaluator: E) -> Result<(), RegistryError>
    where
        E: RowEvaluator + 'static,
    {
        self.register(Arc::new(SyncEvaluator::new(evaluator)))
    }

    pub fn names(&self) -> Vec<String> {
        self.evaluators.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.evaluators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluators.is_empty()
    }

    /// Run every evaluator, in registration order, on one record's output.
    pub async fn evaluate(&self, record: &Record, output: &Value) -> Vec<RawEvaluation> {
        let mut results = Vec::with_capacity(self.evaluators.len());
        for evaluator in &self.evaluators {
            let outcome = run_one(evaluator.as_ref(), record, output).await;
            if let Err(e) = &outcome {
                tracing::warn!(
                    evaluator = %evaluator.name(),
                    record_id = %record.id,
                    error = %e,
                    "Evaluator failed"
                );
            }
            results.push(RawEvaluation {
                evaluator_name: evaluator.name().to_string(),
                outcome,
            });
        }
        results
    }
}

async fn run_one(
    evaluator: &dyn AsyncRowEvaluator,
    record: &Record,
    output: &Value,
) -> Result<EvaluatorOutput, EvaluatorError> {
    let call = AssertUnwindSafe(evaluator.evaluate(
        &record.input_data,
        output,
        record.expected_output.as_ref(),
    ))
    .catch_unwind();

    let caught = match evaluator.timeout() {
        Some(timeout) => match tokio::time::timeout(timeout, call).await {
            Ok(caught) => caught,
            Err(_) => {
                return Err(EvaluatorError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        },
        None => call.await,
    };

    caught.unwrap_or_else(|payload| {
        Err(EvaluatorError::Panicked {
            message: panic_message(payload.as_ref()),
        })
    })
}
