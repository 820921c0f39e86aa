//! Exact, case-sensitive comparison against the expected output.

use serde_json::Value;

use super::RowEvaluator;
use crate::evaluation::{EvaluatorError, EvaluatorOutput};

pub struct ExactMatch {
    name: String,
}

impl ExactMatch {
    pub fn new() -> Self {
        Self::named("exact_match")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ExactMatch {
    fn default() -> Self {
        Self::new()
    }
}

impl RowEvaluator for ExactMatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        _input: &Value,
        output: &Value,
        expected: Option<&Value>,
    ) -> Result<EvaluatorOutput, EvaluatorError> {
        let expected = expected.ok_or(EvaluatorError::MissingExpected)?;
        Ok((output == expected).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::Score;
    use serde_json::json;

    #[test]
    fn test_case_sensitive() {
        let evaluator = ExactMatch::new();
        let output = json!("Paris");

        let hit = evaluator.evaluate(&json!({}), &output, Some(&json!("Paris"))).unwrap();
        assert_eq!(hit.score(), &Score::Bool(true));

        let miss = evaluator.evaluate(&json!({}), &output, Some(&json!("paris"))).unwrap();
        assert_eq!(miss.score(), &Score::Bool(false));
    }

    #[test]
    fn test_missing_expected() {
        let err = ExactMatch::new()
            .evaluate(&json!({}), &json!("Paris"), None)
            .unwrap_err();
        assert_eq!(err, EvaluatorError::MissingExpected);
    }
}
