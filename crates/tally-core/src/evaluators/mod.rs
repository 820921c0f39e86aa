//! Row evaluators.
//!
//! A row evaluator scores one task output against its record. It sees the
//! record's input, the task output and the expected output (if any), and
//! returns a bare value or a [`RichResult`](crate::RichResult).
//!
//! Evaluators must not hold shared mutable state: the runtime calls them
//! from several workers at once.

mod exact_match;
mod function;

pub use exact_match::ExactMatch;
pub use function::{from_fn, FnEvaluator};

use serde_json::Value;
use thiserror::Error;

use crate::evaluation::{EvaluatorError, EvaluatorOutput};

/// Configuration errors raised while registering evaluators.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Evaluator name registered twice: {0}")]
    DuplicateName(String),

    #[error("Evaluator name must not be empty")]
    EmptyName,
}

/// Trait implemented by synchronous row evaluators.
pub trait RowEvaluator: Send + Sync {
    /// Unique name within a run; keys metric kinds and summary lookups.
    fn name(&self) -> &str;

    /// Score one successfully executed record.
    fn evaluate(
        &self,
        input: &Value,
        output: &Value,
        expected: Option<&Value>,
    ) -> Result<EvaluatorOutput, EvaluatorError>;
}
