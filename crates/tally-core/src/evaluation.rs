//! Evaluator result model.
//!
//! Evaluators return either a bare value or a rich result. Both are
//! normalized into an [`EvaluationResult`] whose [`MetricKind`] is fixed the
//! first time an evaluator name produces a value in a run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A tagged evaluator value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Score {
    Bool(bool),
    Number(f64),
    Text(String),
    Structured(Value),
}

impl Score {
    /// Classify an arbitrary JSON value.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Bool(b) => Score::Bool(b),
            Value::Number(n) => match n.as_f64() {
                Some(f) => Score::Number(f),
                None => Score::Structured(Value::Number(n)),
            },
            Value::String(s) => Score::Text(s),
            other => Score::Structured(other),
        }
    }

    /// The aggregation family this value belongs to.
    pub fn kind(&self) -> MetricKind {
        match self {
            Score::Bool(_) => MetricKind::Ratio,
            Score::Number(_) => MetricKind::Average,
            Score::Text(_) => MetricKind::Mode,
            Score::Structured(_) => MetricKind::NonAggregatable,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Score::Bool(b) => Value::Bool(*b),
            Score::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Score::Text(s) => Value::String(s.clone()),
            Score::Structured(v) => v.clone(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Score::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Score::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Score::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Score {
    fn from(value: bool) -> Self {
        Score::Bool(value)
    }
}

impl From<f64> for Score {
    fn from(value: f64) -> Self {
        Score::Number(value)
    }
}

impl From<i64> for Score {
    fn from(value: i64) -> Self {
        Score::Number(value as f64)
    }
}

impl From<&str> for Score {
    fn from(value: &str) -> Self {
        Score::Text(value.to_string())
    }
}

impl From<String> for Score {
    fn from(value: String) -> Self {
        Score::Text(value)
    }
}

impl From<Value> for Score {
    fn from(value: Value) -> Self {
        Score::from_value(value)
    }
}

/// How an evaluator's values aggregate across records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Booleans, aggregated as the fraction of `true`
    Ratio,
    /// Numbers, aggregated as the mean
    Average,
    /// Strings, aggregated as the most frequent value
    Mode,
    /// Structured values, counted only
    NonAggregatable,
}

/// Pass/fail verdict attached to a rich result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Assessment {
    Pass,
    Fail,
}

impl Assessment {
    pub fn from_passed(passed: bool) -> Self {
        if passed {
            Assessment::Pass
        } else {
            Assessment::Fail
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Assessment::Pass)
    }
}

/// A value with optional explanation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RichResult {
    pub value: Score,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub assessment: Option<Assessment>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl RichResult {
    pub fn new(value: impl Into<Score>) -> Self {
        Self {
            value: value.into(),
            reasoning: None,
            assessment: None,
            tags: Vec::new(),
            metadata: None,
        }
    }

    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn assessment(mut self, assessment: Assessment) -> Self {
        self.assessment = Some(assessment);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// What a row evaluator returns.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluatorOutput {
    Bare(Score),
    Rich(RichResult),
}

impl EvaluatorOutput {
    /// The bare value, with any rich wrapper removed.
    pub fn score(&self) -> &Score {
        match self {
            EvaluatorOutput::Bare(score) => score,
            EvaluatorOutput::Rich(rich) => &rich.value,
        }
    }
}

macro_rules! bare_output_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for EvaluatorOutput {
                fn from(value: $ty) -> Self {
                    EvaluatorOutput::Bare(value.into())
                }
            }
        )*
    };
}

bare_output_from!(bool, f64, i64, &str, String, Value);

impl From<Score> for EvaluatorOutput {
    fn from(value: Score) -> Self {
        EvaluatorOutput::Bare(value)
    }
}

impl From<RichResult> for EvaluatorOutput {
    fn from(value: RichResult) -> Self {
        EvaluatorOutput::Rich(value)
    }
}

/// Errors isolated to one record × evaluator cell.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvaluatorError {
    #[error("Evaluator failed: {message}")]
    Failed { message: String },

    #[error("Record has no expected output")]
    MissingExpected,

    #[error("Output cannot be evaluated: {message}")]
    InvalidOutput { message: String },

    #[error("Evaluator '{evaluator}' returned a {observed:?} value but its metric kind is fixed as {fixed:?}")]
    KindMismatch {
        evaluator: String,
        fixed: MetricKind,
        observed: MetricKind,
    },

    #[error("Evaluator timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Evaluator panicked: {message}")]
    Panicked { message: String },
}

impl EvaluatorError {
    pub fn failed(message: impl Into<String>) -> Self {
        EvaluatorError::Failed {
            message: message.into(),
        }
    }

    pub fn invalid_output(message: impl Into<String>) -> Self {
        EvaluatorError::InvalidOutput {
            message: message.into(),
        }
    }
}

/// One normalized evaluator result. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationResult {
    pub evaluator_name: String,
    pub record_id: String,
    pub value: Score,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<Assessment>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub metric_kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// The outcome of one evaluator on one record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EvaluationCell {
    Completed(EvaluationResult),
    Failed {
        evaluator_name: String,
        record_id: String,
        error: EvaluatorError,
    },
}

impl EvaluationCell {
    pub fn evaluator_name(&self) -> &str {
        match self {
            EvaluationCell::Completed(result) => &result.evaluator_name,
            EvaluationCell::Failed { evaluator_name, .. } => evaluator_name,
        }
    }

    pub fn result(&self) -> Option<&EvaluationResult> {
        match self {
            EvaluationCell::Completed(result) => Some(result),
            EvaluationCell::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, EvaluationCell::Failed { .. })
    }
}

/// Fixes each evaluator's metric kind at its first observed value.
///
/// Feed cells in dataset record order so the kind does not depend on
/// completion order.
#[derive(Debug, Clone, Default)]
pub struct MetricKindLedger {
    kinds: BTreeMap<String, MetricKind>,
}

impl MetricKindLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `score` for `evaluator`, failing if it contradicts the fixed kind.
    pub fn observe(&mut self, evaluator: &str, score: &Score) -> Result<MetricKind, EvaluatorError> {
        let observed = score.kind();
        match self.kinds.get(evaluator) {
            Some(fixed) if *fixed != observed => Err(EvaluatorError::KindMismatch {
                evaluator: evaluator.to_string(),
                fixed: *fixed,
                observed,
            }),
            Some(fixed) => Ok(*fixed),
            None => {
                self.kinds.insert(evaluator.to_string(), observed);
                Ok(observed)
            }
        }
    }

    /// Turn a raw evaluator outcome into a cell.
    pub fn normalize(
        &mut self,
        evaluator: &str,
        record_id: &str,
        raw: Result<EvaluatorOutput, EvaluatorError>,
    ) -> EvaluationCell {
        let failed = |error| EvaluationCell::Failed {
            evaluator_name: evaluator.to_string(),
            record_id: record_id.to_string(),
            error,
        };

        let output = match raw {
            Ok(output) => output,
            Err(error) => return failed(error),
        };
        if let Some(n) = output.score().as_f64().filter(|n| !n.is_finite()) {
            return failed(EvaluatorError::invalid_output(format!(
                "numeric value {} is not finite",
                n
            )));
        }
        let metric_kind = match self.observe(evaluator, output.score()) {
            Ok(kind) => kind,
            Err(error) => {
                tracing::warn!(evaluator, record_id, error = %error, "Evaluator value kind changed mid-run");
                return failed(error);
            }
        };

        let (value, reasoning, assessment, tags, metadata) = match output {
            EvaluatorOutput::Bare(score) => (score, None, None, Vec::new(), None),
            EvaluatorOutput::Rich(rich) => (
                rich.value,
                rich.reasoning,
                rich.assessment,
                rich.tags,
                rich.metadata,
            ),
        };

        EvaluationCell::Completed(EvaluationResult {
            evaluator_name: evaluator.to_string(),
            record_id: record_id.to_string(),
            value,
            reasoning,
            assessment,
            tags,
            metric_kind,
            metadata,
        })
    }

    pub fn kinds(&self) -> &BTreeMap<String, MetricKind> {
        &self.kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_inference() {
        assert_eq!(Score::from_value(json!(true)).kind(), MetricKind::Ratio);
        assert_eq!(Score::from_value(json!(0.5)).kind(), MetricKind::Average);
        assert_eq!(Score::from_value(json!(3)).kind(), MetricKind::Average);
        assert_eq!(Score::from_value(json!("yes")).kind(), MetricKind::Mode);
        assert_eq!(
            Score::from_value(json!({"a": 1})).kind(),
            MetricKind::NonAggregatable
        );
        assert_eq!(Score::from_value(json!(null)).kind(), MetricKind::NonAggregatable);
    }

    #[test]
    fn test_kind_fixed_at_first_observation() {
        let mut ledger = MetricKindLedger::new();
        assert_eq!(ledger.observe("judge", &Score::Bool(true)), Ok(MetricKind::Ratio));
        assert_eq!(ledger.observe("judge", &Score::Bool(false)), Ok(MetricKind::Ratio));

        let err = ledger.observe("judge", &Score::Number(0.3)).unwrap_err();
        assert_eq!(
            err,
            EvaluatorError::KindMismatch {
                evaluator: "judge".to_string(),
                fixed: MetricKind::Ratio,
                observed: MetricKind::Average,
            }
        );
        assert_eq!(ledger.kinds().get("judge"), Some(&MetricKind::Ratio));
    }

    #[test]
    fn test_normalize_unwraps_rich_result() {
        let mut ledger = MetricKindLedger::new();
        let rich = RichResult::new(0.8)
            .reasoning("close enough")
            .assessment(Assessment::Pass)
            .tag("fuzzy");

        let cell = ledger.normalize("similarity", "r1", Ok(rich.into()));
        let result = cell.result().unwrap();
        assert_eq!(result.value, Score::Number(0.8));
        assert_eq!(result.reasoning.as_deref(), Some("close enough"));
        assert_eq!(result.assessment, Some(Assessment::Pass));
        assert_eq!(result.tags, vec!["fuzzy".to_string()]);
        assert_eq!(result.metric_kind, MetricKind::Average);
    }

    #[test]
    fn test_normalize_error_is_failed_cell() {
        let mut ledger = MetricKindLedger::new();
        let cell = ledger.normalize("exact_match", "r1", Err(EvaluatorError::MissingExpected));
        assert!(cell.is_failed());
        assert_eq!(cell.evaluator_name(), "exact_match");
        assert_eq!(ledger.kinds().get("exact_match"), None);
    }

    #[test]
    fn test_non_finite_number_is_failed_cell() {
        let mut ledger = MetricKindLedger::new();
        let cell = ledger.normalize("similarity", "r1", Ok(Score::Number(f64::NAN).into()));
        assert!(matches!(
            cell,
            EvaluationCell::Failed {
                error: EvaluatorError::InvalidOutput { .. },
                ..
            }
        ));
        let rich = RichResult::new(f64::INFINITY).reasoning("0/0");
        assert!(ledger.normalize("similarity", "r2", Ok(rich.into())).is_failed());
        assert_eq!(ledger.kinds().get("similarity"), None);

        let cell = ledger.normalize("similarity", "r3", Ok(Score::Number(0.5).into()));
        assert_eq!(cell.result().map(|r| r.metric_kind), Some(MetricKind::Average));
    }

    #[test]
    fn test_cell_serializes_with_status() {
        let cell = EvaluationCell::Failed {
            evaluator_name: "exact_match".to_string(),
            record_id: "r1".to_string(),
            error: EvaluatorError::Timeout { timeout_ms: 250 },
        };
        let json = serde_json::to_value(&cell).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "timeout");
    }
}
