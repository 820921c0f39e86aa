//! Run reports.
//!
//! An [`ExperimentReport`] is produced for every run, including runs where
//! every task failed. It is addressed by its run id and persisted as
//! `<run_id>.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::evaluation::EvaluationCell;
use crate::span::SpanContext;
use crate::summary::{MetricAggregate, SummaryCell};

/// Errors isolated to one record's task invocation.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    #[error("Task failed: {message}")]
    Failed { message: String },

    #[error("Task timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Task panicked: {message}")]
    Panicked { message: String },
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed {
            message: message.into(),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// One task invocation against one record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub record_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Wall time across all attempts, in milliseconds on the wire
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub attempts: u32,
}

impl ExecutionRecord {
    pub fn succeeded(record_id: impl Into<String>, output: Value, duration: Duration, attempts: u32) -> Self {
        Self {
            record_id: record_id.into(),
            output: Some(output),
            error: None,
            duration,
            attempts,
        }
    }

    pub fn failed(record_id: impl Into<String>, error: TaskError, duration: Duration, attempts: u32) -> Self {
        Self {
            record_id: record_id.into(),
            output: None,
            error: Some(error),
            duration,
            attempts,
        }
    }

    /// The output, if the task succeeded.
    pub fn successful_output(&self) -> Option<&Value> {
        match (&self.output, &self.error) {
            (Some(output), None) => Some(output),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.successful_output().is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Task and every evaluator succeeded
    Succeeded,
    /// Task succeeded, at least one evaluator failed
    PartiallyEvaluated,
    /// Task failed; no evaluator ran
    Failed,
}

/// Everything a run produced for one record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordReport {
    /// Position in the dispatched record sequence
    pub index: usize,
    pub span: SpanContext,
    pub status: RecordStatus,
    pub execution: ExecutionRecord,
    #[serde(default)]
    pub evaluations: Vec<EvaluationCell>,
}

impl RecordReport {
    pub fn new(
        index: usize,
        span: SpanContext,
        execution: ExecutionRecord,
        evaluations: Vec<EvaluationCell>,
    ) -> Self {
        let status = if !execution.is_success() {
            RecordStatus::Failed
        } else if evaluations.iter().any(EvaluationCell::is_failed) {
            RecordStatus::PartiallyEvaluated
        } else {
            RecordStatus::Succeeded
        };
        Self {
            index,
            span,
            status,
            execution,
            evaluations,
        }
    }

    pub fn record_id(&self) -> &str {
        &self.execution.record_id
    }
}

/// Run identity and configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    pub run_id: String,
    pub dataset_name: String,
    pub dataset_version: u64,
    pub jobs: usize,
    #[serde(default)]
    pub sample_size: Option<usize>,
    pub raise_errors: bool,
    #[serde(default)]
    pub config: Value,
    pub evaluators: Vec<String>,
    pub summary_evaluators: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when the run stopped at the first task error
    #[serde(default)]
    pub aborted: bool,
}

impl RunMetadata {
    pub fn new_run_id() -> String {
        Uuid::new_v4().to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub succeeded: usize,
    pub partially_evaluated: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.succeeded + self.partially_evaluated + self.failed
    }
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to access report: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid run id: {0}")]
    InvalidRunId(String),
}

/// The full result of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentReport {
    pub per_record: Vec<RecordReport>,
    pub summary: Vec<SummaryCell>,
    #[serde(default)]
    pub metrics: Vec<MetricAggregate>,
    pub run_metadata: RunMetadata,
}

impl ExperimentReport {
    pub fn run_id(&self) -> &str {
        &self.run_metadata.run_id
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in &self.per_record {
            match record.status {
                RecordStatus::Succeeded => counts.succeeded += 1,
                RecordStatus::PartiallyEvaluated => counts.partially_evaluated += 1,
                RecordStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn record(&self, record_id: &str) -> Option<&RecordReport> {
        self.per_record.iter().find(|r| r.record_id() == record_id)
    }

    pub fn summary_value(&self, evaluator: &str) -> Option<&Value> {
        self.summary
            .iter()
            .find(|cell| cell.evaluator_name() == evaluator)
            .and_then(SummaryCell::value)
    }

    pub fn path_in(dir: impl AsRef<Path>, run_id: &str) -> Result<PathBuf, ReportError> {
        Uuid::parse_str(run_id).map_err(|_| ReportError::InvalidRunId(run_id.to_string()))?;
        Ok(dir.as_ref().join(format!("{}.json", run_id)))
    }

    /// Write `<run_id>.json` under `dir`, creating it if needed.
    pub fn save_to_dir(&self, dir: impl AsRef<Path>) -> Result<PathBuf, ReportError> {
        fs::create_dir_all(dir.as_ref())?;
        let path = Self::path_in(dir, self.run_id())?;
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn load_from_dir(dir: impl AsRef<Path>, run_id: &str) -> Result<Self, ReportError> {
        let path = Self::path_in(dir, run_id)?;
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{EvaluationResult, EvaluatorError, MetricKind, Score};
    use serde_json::json;

    fn cell(ok: bool) -> EvaluationCell {
        if ok {
            EvaluationCell::Completed(EvaluationResult {
                evaluator_name: "exact_match".to_string(),
                record_id: "r1".to_string(),
                value: Score::Bool(true),
                reasoning: None,
                assessment: None,
                tags: vec![],
                metric_kind: MetricKind::Ratio,
                metadata: None,
            })
        } else {
            EvaluationCell::Failed {
                evaluator_name: "judge".to_string(),
                record_id: "r1".to_string(),
                error: EvaluatorError::Timeout { timeout_ms: 100 },
            }
        }
    }

    fn metadata() -> RunMetadata {
        let now = Utc::now();
        RunMetadata {
            run_id: RunMetadata::new_run_id(),
            dataset_name: "capitals".to_string(),
            dataset_version: 2,
            jobs: 4,
            sample_size: None,
            raise_errors: false,
            config: json!({"model": "m"}),
            evaluators: vec!["exact_match".to_string(), "judge".to_string()],
            summary_evaluators: vec![],
            started_at: now,
            finished_at: now,
            aborted: false,
        }
    }

    #[test]
    fn test_status_distinguishes_task_and_evaluator_failure() {
        let ok = ExecutionRecord::succeeded("r1", json!("Paris"), Duration::from_millis(5), 1);
        let failed = ExecutionRecord::failed("r2", TaskError::failed("boom"), Duration::from_millis(5), 3);

        let span = SpanContext::mint();
        assert_eq!(
            RecordReport::new(0, span.clone(), ok.clone(), vec![cell(true)]).status,
            RecordStatus::Succeeded
        );
        assert_eq!(
            RecordReport::new(0, span.clone(), ok, vec![cell(true), cell(false)]).status,
            RecordStatus::PartiallyEvaluated
        );
        assert_eq!(
            RecordReport::new(1, span, failed, vec![]).status,
            RecordStatus::Failed
        );
    }

    #[test]
    fn test_duration_serializes_as_millis() {
        let record = ExecutionRecord::succeeded("r1", json!(1), Duration::from_millis(1500), 1);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["duration"], 1500);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_save_and_load_by_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let report = ExperimentReport {
            per_record: vec![RecordReport::new(
                0,
                SpanContext::mint(),
                ExecutionRecord::failed("r1", TaskError::Timeout { timeout_ms: 50 }, Duration::from_millis(50), 1),
                vec![],
            )],
            summary: vec![],
            metrics: vec![],
            run_metadata: metadata(),
        };

        let path = report.save_to_dir(dir.path()).unwrap();
        assert!(path.ends_with(format!("{}.json", report.run_id())));

        let loaded = ExperimentReport::load_from_dir(dir.path(), report.run_id()).unwrap();
        assert_eq!(loaded, report);
        assert_eq!(loaded.status_counts().failed, 1);
    }

    #[test]
    fn test_report_with_non_finite_score_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = crate::evaluation::MetricKindLedger::new();
        let evaluations = vec![
            ledger.normalize("similarity", "r1", Ok(Score::Number(f64::NAN).into())),
            ledger.normalize("exact_match", "r1", Ok(Score::Bool(true).into())),
        ];
        let report = ExperimentReport {
            per_record: vec![RecordReport::new(
                0,
                SpanContext::mint(),
                ExecutionRecord::succeeded("r1", json!("Paris"), Duration::from_millis(5), 1),
                evaluations,
            )],
            summary: vec![],
            metrics: vec![],
            run_metadata: metadata(),
        };
        assert_eq!(report.per_record[0].status, RecordStatus::PartiallyEvaluated);

        report.save_to_dir(dir.path()).unwrap();
        let loaded = ExperimentReport::load_from_dir(dir.path(), report.run_id()).unwrap();
        assert_eq!(loaded, report);
    }

    #[test]
    fn test_rejects_path_like_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let err = ExperimentReport::load_from_dir(dir.path(), "../etc/passwd").unwrap_err();
        assert!(matches!(err, ReportError::InvalidRunId(_)));
    }
}
