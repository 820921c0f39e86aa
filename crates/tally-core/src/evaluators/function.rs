//! Closure-backed row evaluators.

use std::marker::PhantomData;

use serde_json::Value;

use super::RowEvaluator;
use crate::evaluation::{EvaluatorError, EvaluatorOutput};

/// A row evaluator backed by a closure returning anything convertible into
/// an [`EvaluatorOutput`].
pub struct FnEvaluator<F, R> {
    name: String,
    f: F,
    _output: PhantomData<fn() -> R>,
}

/// Build an evaluator from a closure.
///
/// ```rust,ignore
/// let contains = from_fn("contains_city", |_input, output, _expected| {
///     Ok(output.as_str().is_some_and(|s| s.contains("Paris")))
/// });
/// ```
pub fn from_fn<F, R>(name: impl Into<String>, f: F) -> FnEvaluator<F, R>
where
    F: Fn(&Value, &Value, Option<&Value>) -> Result<R, EvaluatorError> + Send + Sync,
    R: Into<EvaluatorOutput>,
{
    FnEvaluator {
        name: name.into(),
        f,
        _output: PhantomData,
    }
}

impl<F, R> RowEvaluator for FnEvaluator<F, R>
where
    F: Fn(&Value, &Value, Option<&Value>) -> Result<R, EvaluatorError> + Send + Sync,
    R: Into<EvaluatorOutput>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        input: &Value,
        output: &Value,
        expected: Option<&Value>,
    ) -> Result<EvaluatorOutput, EvaluatorError> {
        (self.f)(input, output, expected).map(Into::into)
    }
}
