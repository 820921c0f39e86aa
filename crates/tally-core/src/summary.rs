//! Summary aggregation.
//!
//! Summary evaluators run exactly once per run, after every row evaluator
//! has finished on every successfully executed record. They see the inputs,
//! outputs and expected outputs of those records plus each row evaluator's
//! bare values, aligned with the record sequence.
//!
//! A summary evaluator that asks for an evaluator with no results fails
//! with `missing_dependency`. It never receives an empty default.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::evaluation::{EvaluationCell, MetricKind, MetricKindLedger, Score};
use crate::evaluators::RegistryError;
use crate::panic_message;

/// Errors isolated to one summary evaluator.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SummaryEvaluatorError {
    #[error("Summary evaluator failed: {message}")]
    Failed { message: String },

    #[error("Missing dependency: no results for evaluator '{dependency}'")]
    MissingDependency { dependency: String },

    #[error("Summary evaluator panicked: {message}")]
    Panicked { message: String },
}

impl SummaryEvaluatorError {
    pub fn failed(message: impl Into<String>) -> Self {
        SummaryEvaluatorError::Failed {
            message: message.into(),
        }
    }
}

/// Per-evaluator bare values, aligned with the successful-record sequence.
///
/// `None` marks a record on which that evaluator failed. Evaluators that
/// failed on every record are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluatorResults {
    values: BTreeMap<String, Vec<Option<Score>>>,
}

impl EvaluatorResults {
    /// Collect values from each record's cells, in record order.
    pub fn from_rows<'a, I>(evaluator_names: &[String], rows: I) -> Self
    where
        I: IntoIterator<Item = &'a [EvaluationCell]>,
    {
        let mut values: BTreeMap<String, Vec<Option<Score>>> = evaluator_names
            .iter()
            .map(|name| (name.clone(), Vec::new()))
            .collect();

        for cells in rows {
            for (name, column) in values.iter_mut() {
                let value = cells
                    .iter()
                    .find(|cell| cell.evaluator_name() == name)
                    .and_then(EvaluationCell::result)
                    .map(|result| result.value.clone());
                column.push(value);
            }
        }

        values.retain(|_, column| column.iter().any(Option::is_some));
        Self { values }
    }

    /// Aligned values for `evaluator`.
    pub fn get(&self, evaluator: &str) -> Result<&[Option<Score>], SummaryEvaluatorError> {
        self.values
            .get(evaluator)
            .map(Vec::as_slice)
            .ok_or_else(|| SummaryEvaluatorError::MissingDependency {
                dependency: evaluator.to_string(),
            })
    }

    /// Only the values that exist, in record order.
    pub fn present(&self, evaluator: &str) -> Result<Vec<&Score>, SummaryEvaluatorError> {
        Ok(self.get(evaluator)?.iter().flatten().collect())
    }

    pub fn contains(&self, evaluator: &str) -> bool {
        self.values.contains_key(evaluator)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// The slices a summary evaluator sees. All four are aligned by record.
#[derive(Debug, Clone, Copy)]
pub struct SummaryInput<'a> {
    pub inputs: &'a [Value],
    pub outputs: &'a [Value],
    pub expected_outputs: &'a [Option<Value>],
    pub evaluator_results: &'a EvaluatorResults,
}

/// Trait implemented by summary evaluators.
pub trait SummaryEvaluator: Send + Sync {
    fn name(&self) -> &str;

    /// Row evaluators this summary reads. Checked before `evaluate` runs.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn evaluate(&self, input: SummaryInput<'_>) -> Result<Value, SummaryEvaluatorError>;
}

/// One computed summary value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryResult {
    pub evaluator_name: String,
    pub value: Value,
}

/// The outcome of one summary evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SummaryCell {
    Completed(SummaryResult),
    Failed {
        evaluator_name: String,
        error: SummaryEvaluatorError,
    },
}

impl SummaryCell {
    pub fn evaluator_name(&self) -> &str {
        match self {
            SummaryCell::Completed(result) => &result.evaluator_name,
            SummaryCell::Failed { evaluator_name, .. } => evaluator_name,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            SummaryCell::Completed(result) => Some(&result.value),
            SummaryCell::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&SummaryEvaluatorError> {
        match self {
            SummaryCell::Completed(_) => None,
            SummaryCell::Failed { error, .. } => Some(error),
        }
    }
}

/// Runs every registered summary evaluator once.
#[derive(Default, Clone)]
pub struct SummaryAggregator {
    evaluators: Vec<Arc<dyn SummaryEvaluator>>,
}

impl SummaryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a summary evaluator. Names must be unique.
    pub fn register(&mut self, evaluator: Arc<dyn SummaryEvaluator>) -> Result<(), RegistryError> {
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

    pub fn names(&self) -> Vec<String> {
        self.evaluators.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluators.is_empty()
    }

    /// Run all summary evaluators, isolating each failure.
    pub fn aggregate(&self, input: SummaryInput<'_>) -> Vec<SummaryCell> {
        self.evaluators
            .iter()
            .map(|evaluator| {
                let name = evaluator.name().to_string();
                match run_one(evaluator.as_ref(), input) {
                    Ok(value) => SummaryCell::Completed(SummaryResult {
                        evaluator_name: name,
                        value,
                    }),
                    Err(error) => {
                        tracing::warn!(evaluator = %name, error = %error, "Summary evaluator failed");
                        SummaryCell::Failed {
                            evaluator_name: name,
                            error,
                        }
                    }
                }
            })
            .collect()
    }
}

fn run_one(
    evaluator: &dyn SummaryEvaluator,
    input: SummaryInput<'_>,
) -> Result<Value, SummaryEvaluatorError> {
    for dependency in evaluator.dependencies() {
        if !input.evaluator_results.contains(&dependency) {
            return Err(SummaryEvaluatorError::MissingDependency { dependency });
        }
    }

    catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(input))).unwrap_or_else(|payload| {
        Err(SummaryEvaluatorError::Panicked {
            message: panic_message(payload.as_ref()),
        })
    })
}

/// A summary evaluator backed by a closure.
pub struct FnSummaryEvaluator<F> {
    name: String,
    dependencies: Vec<String>,
    f: F,
}

impl<F> FnSummaryEvaluator<F>
where
    F: Fn(SummaryInput<'_>) -> Result<Value, SummaryEvaluatorError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            f,
        }
    }

    pub fn depends_on(mut self, evaluator: impl Into<String>) -> Self {
        self.dependencies.push(evaluator.into());
        self
    }
}

impl<F> SummaryEvaluator for FnSummaryEvaluator<F>
where
    F: Fn(SummaryInput<'_>) -> Result<Value, SummaryEvaluatorError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    fn evaluate(&self, input: SummaryInput<'_>) -> Result<Value, SummaryEvaluatorError> {
        (self.f)(input)
    }
}

/// Fraction of records on which a row evaluator passed.
///
/// Boolean values pass when `true`; numeric values pass at or above the
/// threshold.
pub struct PassRate {
    name: String,
    evaluator: String,
    threshold: f64,
}

impl PassRate {
    pub fn new(evaluator: impl Into<String>) -> Self {
        let evaluator = evaluator.into();
        Self {
            name: format!("{}_pass_rate", evaluator),
            evaluator,
            threshold: 1.0,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

impl SummaryEvaluator for PassRate {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        vec![self.evaluator.clone()]
    }

    fn evaluate(&self, input: SummaryInput<'_>) -> Result<Value, SummaryEvaluatorError> {
        let values = input.evaluator_results.present(&self.evaluator)?;
        let mut passed = 0usize;
        for value in &values {
            let ok = match value {
                Score::Bool(b) => *b,
                Score::Number(n) => *n >= self.threshold,
                other => {
                    return Err(SummaryEvaluatorError::failed(format!(
                        "pass rate needs boolean or numeric values, '{}' produced {:?}",
                        self.evaluator,
                        other.kind()
                    )))
                }
            };
            if ok {
                passed += 1;
            }
        }
        Ok(json!(passed as f64 / values.len() as f64))
    }
}

/// Built-in aggregate of one row evaluator, chosen by its metric kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricAggregate {
    pub evaluator_name: String,
    pub metric_kind: MetricKind,
    /// Records with a value
    pub count: usize,
    /// Records where the evaluator failed
    pub failed: usize,
    /// Ratio, mean or mode; `None` for non-aggregatable kinds
    pub value: Option<Value>,
}

/// Aggregate every evaluator whose metric kind is known.
pub fn metric_aggregates(
    ledger: &MetricKindLedger,
    results: &EvaluatorResults,
) -> Vec<MetricAggregate> {
    ledger
        .kinds()
        .iter()
        .filter_map(|(name, kind)| {
            let column = results.get(name).ok()?;
            Some(aggregate_column(name, *kind, column))
        })
        .collect()
}

fn aggregate_column(name: &str, kind: MetricKind, column: &[Option<Score>]) -> MetricAggregate {
    let present: Vec<&Score> = column.iter().flatten().collect();
    let count = present.len();

    let value = match kind {
        MetricKind::Ratio => {
            let trues = present.iter().filter(|s| s.as_bool() == Some(true)).count();
            (count > 0).then(|| json!(trues as f64 / count as f64))
        }
        MetricKind::Average => {
            let sum: f64 = present.iter().filter_map(|s| s.as_f64()).sum();
            (count > 0).then(|| json!(sum / count as f64))
        }
        MetricKind::Mode => mode(present.iter().filter_map(|s| s.as_str())).map(Value::from),
        MetricKind::NonAggregatable => None,
    };

    MetricAggregate {
        evaluator_name: name.to_string(),
        metric_kind: kind,
        count,
        failed: column.len() - count,
        value,
    }
}

/// Most frequent string; ties go to the earliest value.
fn mode<'a>(values: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(v, _)| *v == value) {
            Some((_, n)) => *n += 1,
            None => counts.push((value, 1)),
        }
    }
    let mut best: Option<(&str, usize)> = None;
    for (value, n) in counts {
        if best.map_or(true, |(_, top)| n > top) {
            best = Some((value, n));
        }
    }
    best.map(|(value, _)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{EvaluationResult, EvaluatorError};

    fn completed(name: &str, record: &str, value: Score) -> EvaluationCell {
        EvaluationCell::Completed(EvaluationResult {
            evaluator_name: name.to_string(),
            record_id: record.to_string(),
            metric_kind: value.kind(),
            value,
            reasoning: None,
            assessment: None,
            tags: vec![],
            metadata: None,
        })
    }

    fn failed(name: &str, record: &str) -> EvaluationCell {
        EvaluationCell::Failed {
            evaluator_name: name.to_string(),
            record_id: record.to_string(),
            error: EvaluatorError::failed("boom"),
        }
    }

    fn sample_results() -> EvaluatorResults {
        let rows = vec![
            vec![completed("exact_match", "r1", Score::Bool(true)), failed("judge", "r1")],
            vec![completed("exact_match", "r2", Score::Bool(false)), failed("judge", "r2")],
            vec![completed("exact_match", "r3", Score::Bool(true)), failed("judge", "r3")],
        ];
        let names = vec!["exact_match".to_string(), "judge".to_string()];
        EvaluatorResults::from_rows(&names, rows.iter().map(Vec::as_slice))
    }

    fn input<'a>(results: &'a EvaluatorResults) -> SummaryInput<'a> {
        SummaryInput {
            inputs: &[],
            outputs: &[],
            expected_outputs: &[],
            evaluator_results: results,
        }
    }

    #[test]
    fn test_results_are_aligned_and_unwrapped() {
        let results = sample_results();
        assert_eq!(
            results.get("exact_match").unwrap(),
            &[Some(Score::Bool(true)), Some(Score::Bool(false)), Some(Score::Bool(true))]
        );
    }

    #[test]
    fn test_evaluator_failing_everywhere_is_missing() {
        let results = sample_results();
        assert!(!results.contains("judge"));
        assert_eq!(
            results.get("judge").unwrap_err(),
            SummaryEvaluatorError::MissingDependency {
                dependency: "judge".to_string()
            }
        );
    }

    #[test]
    fn test_missing_dependency_is_explicit() {
        let mut aggregator = SummaryAggregator::new();
        aggregator
            .register(Arc::new(PassRate::new("exact_macth")))
            .unwrap();
        let results = sample_results();

        let cells = aggregator.aggregate(input(&results));
        assert_eq!(cells.len(), 1);
        assert!(matches!(
            cells[0].error(),
            Some(SummaryEvaluatorError::MissingDependency { dependency }) if dependency == "exact_macth"
        ));
    }

    #[test]
    fn test_pass_rate() {
        let mut aggregator = SummaryAggregator::new();
        aggregator.register(Arc::new(PassRate::new("exact_match"))).unwrap();
        let results = sample_results();

        let cells = aggregator.aggregate(input(&results));
        let rate = cells[0].value().and_then(Value::as_f64).unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(cells[0].evaluator_name(), "exact_match_pass_rate");
    }

    #[test]
    fn test_failures_are_isolated() {
        let mut aggregator = SummaryAggregator::new();
        aggregator
            .register(Arc::new(FnSummaryEvaluator::new("explodes", |_| {
                panic!("summary blew up")
            })))
            .unwrap();
        aggregator
            .register(Arc::new(FnSummaryEvaluator::new("count", |input: SummaryInput<'_>| {
                Ok(json!(input.evaluator_results.present("exact_match")?.len()))
            })))
            .unwrap();
        let results = sample_results();

        let cells = aggregator.aggregate(input(&results));
        assert!(matches!(
            cells[0].error(),
            Some(SummaryEvaluatorError::Panicked { message }) if message.contains("summary blew up")
        ));
        assert_eq!(cells[1].value(), Some(&json!(3)));
    }

    #[test]
    fn test_duplicate_summary_names() {
        let mut aggregator = SummaryAggregator::new();
        aggregator.register(Arc::new(PassRate::new("exact_match"))).unwrap();
        let err = aggregator
            .register(Arc::new(PassRate::new("other").named("exact_match_pass_rate")))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateName("exact_match_pass_rate".to_string())
        );
    }

    #[test]
    fn test_metric_aggregates_by_kind() {
        let mut ledger = MetricKindLedger::new();
        ledger.observe("exact_match", &Score::Bool(true)).unwrap();
        ledger.observe("label", &Score::Text("a".into())).unwrap();

        let rows = vec![
            vec![completed("exact_match", "r1", Score::Bool(true)), completed("label", "r1", "b".into())],
            vec![completed("exact_match", "r2", Score::Bool(false)), completed("label", "r2", "a".into())],
            vec![failed("exact_match", "r3"), completed("label", "r3", "a".into())],
            vec![completed("exact_match", "r4", Score::Bool(true)), completed("label", "r4", "b".into())],
        ];
        let names = vec!["exact_match".to_string(), "label".to_string()];
        let results = EvaluatorResults::from_rows(&names, rows.iter().map(Vec::as_slice));

        let aggregates = metric_aggregates(&ledger, &results);
        assert_eq!(aggregates.len(), 2);

        let exact = &aggregates[0];
        assert_eq!(exact.metric_kind, MetricKind::Ratio);
        assert_eq!(exact.count, 3);
        assert_eq!(exact.failed, 1);
        let ratio = exact.value.as_ref().and_then(Value::as_f64).unwrap();
        assert!((ratio - 2.0 / 3.0).abs() < 1e-9);

        // "b" and "a" tie at two; "b" was seen first.
        assert_eq!(aggregates[1].value, Some(json!("b")));
    }
}
