//! Experiment controller.
//!
//! The controller owns a run end to end:
//! 1. Validate configuration (fatal on error)
//! 2. Pin the dataset snapshot
//! 3. Fan-out: run the task and row evaluators over every record
//! 4. Fix metric kinds in record order and attach spans
//! 5. Fan-in: run summary evaluators once over the successful records
//! 6. Assemble the report

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tally_core::{
    metric_aggregates, DatasetSnapshot, DatasetStore, DatasetVersionError, EvaluationCell,
    EvaluatorResults, ExperimentReport, MetricKindLedger, RecordReport, RegistryError,
    RunMetadata, SpanLedger, SummaryAggregator, SummaryEvaluator, SummaryInput, TaskError,
};
use thiserror::Error;

use crate::config::{ConfigError, RunConfig};
use crate::evaluator::AsyncRowEvaluator;
use crate::registry::EvaluatorRegistry;
use crate::resilience::RetryPolicy;
use crate::runner::TaskRunner;
use crate::task::Task;

/// Errors from the experiment controller.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("No task configured")]
    TaskNotConfigured,

    #[error("Evaluator registration failed: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dataset(#[from] DatasetVersionError),

    /// The partial report holds every record that completed before the abort.
    #[error("Run aborted at record '{record_id}': {error}")]
    Aborted {
        record_id: String,
        error: TaskError,
        report: Box<ExperimentReport>,
    },
}

/// Runs experiments: one task, its evaluators, and its summaries.
pub struct ExperimentController {
    task: Arc<dyn Task>,
    evaluators: EvaluatorRegistry,
    summaries: SummaryAggregator,
    retry: Option<RetryPolicy>,
    spans: Arc<SpanLedger>,
}

impl ExperimentController {
    pub fn builder() -> ExperimentControllerBuilder {
        ExperimentControllerBuilder::new()
    }

    /// The ledger every run attaches its spans to.
    pub fn spans(&self) -> &Arc<SpanLedger> {
        &self.spans
    }

    pub fn evaluator_names(&self) -> Vec<String> {
        self.evaluators.names()
    }

    /// Resolve `name` at `version` (current when `None`) and run against it.
    ///
    /// Resolving marks the snapshot as used, which resets its retention.
    pub async fn run_dataset(
        &self,
        store: &DatasetStore,
        name: &str,
        version: Option<u64>,
        config: &RunConfig,
    ) -> Result<ExperimentReport, RuntimeError> {
        config.validate()?;
        let snapshot = store.resolve(name, version)?;
        self.run(snapshot, config).await
    }

    /// Run against a pinned snapshot.
    pub async fn run(
        &self,
        snapshot: Arc<DatasetSnapshot>,
        config: &RunConfig,
    ) -> Result<ExperimentReport, RuntimeError> {
        config.validate()?;

        let run_id = RunMetadata::new_run_id();
        let started_at = Utc::now();
        let span = tracing::info_span!(
            "experiment",
            run_id = %run_id,
            dataset = %snapshot.name,
            version = snapshot.version,
        );
        span.in_scope(|| {
            tracing::info!(jobs = config.jobs, sample_size = ?config.sample_size, "Starting run")
        });

        let retry = self
            .retry
            .clone()
            .unwrap_or_else(|| RetryPolicy::from_config(&config.retry));
        let runner = TaskRunner::new(self.task.clone())
            .evaluators(self.evaluators.clone())
            .retry(retry)
            .jobs(config.jobs)
            .sample_size(config.sample_size)
            .raise_errors(config.raise_errors)
            .task_timeout(config.task_timeout);

        let output = runner.run(&snapshot, &config.config).await;

        // Metric kinds are fixed in record order, not completion order.
        let mut kinds = MetricKindLedger::new();
        let mut per_record = Vec::with_capacity(output.outcomes.len());
        for outcome in output.outcomes {
            let record_id = outcome.execution.record_id.clone();
            let cells: Vec<EvaluationCell> = outcome
                .evaluations
                .into_iter()
                .map(|raw| kinds.normalize(&raw.evaluator_name, &record_id, raw.outcome))
                .collect();
            self.spans.attach(&outcome.span, &run_id, &record_id, &cells);
            per_record.push(RecordReport::new(outcome.index, outcome.span, outcome.execution, cells));
        }

        let evaluator_names = self.evaluators.names();
        let successful: Vec<&RecordReport> = per_record
            .iter()
            .filter(|r| r.execution.is_success())
            .collect();
        let results = EvaluatorResults::from_rows(
            &evaluator_names,
            successful.iter().map(|r| r.evaluations.as_slice()),
        );
        let metrics = metric_aggregates(&kinds, &results);

        let summary = if output.aborted.is_some() {
            Vec::new()
        } else {
            let inputs: Vec<Value> = successful
                .iter()
                .map(|r| snapshot.records[r.index].input_data.clone())
                .collect();
            let outputs: Vec<Value> = successful
                .iter()
                .filter_map(|r| r.execution.successful_output().cloned())
                .collect();
            let expected: Vec<Option<Value>> = successful
                .iter()
                .map(|r| snapshot.records[r.index].expected_output.clone())
                .collect();
            self.summaries.aggregate(SummaryInput {
                inputs: &inputs,
                outputs: &outputs,
                expected_outputs: &expected,
                evaluator_results: &results,
            })
        };

        let report = ExperimentReport {
            per_record,
            summary,
            metrics,
            run_metadata: RunMetadata {
                run_id,
                dataset_name: snapshot.name.clone(),
                dataset_version: snapshot.version,
                jobs: config.jobs,
                sample_size: config.sample_size,
                raise_errors: config.raise_errors,
                config: config.config.clone(),
                evaluators: evaluator_names,
                summary_evaluators: self.summaries.names(),
                started_at,
                finished_at: Utc::now(),
                aborted: output.aborted.is_some(),
            },
        };

        let counts = report.status_counts();
        span.in_scope(|| {
            tracing::info!(
                succeeded = counts.succeeded,
                partially_evaluated = counts.partially_evaluated,
                failed = counts.failed,
                "Run finished"
            )
        });

        match output.aborted {
            Some((record_id, error)) => Err(RuntimeError::Aborted {
                record_id,
                error,
                report: Box::new(report),
            }),
            None => Ok(report),
        }
    }
}

/// Builder for ExperimentController.
pub struct ExperimentControllerBuilder {
    task: Option<Arc<dyn Task>>,
    evaluators: Vec<Arc<dyn AsyncRowEvaluator>>,
    summaries: Vec<Arc<dyn SummaryEvaluator>>,
    retry: Option<RetryPolicy>,
    spans: Option<Arc<SpanLedger>>,
}

impl ExperimentControllerBuilder {
    pub fn new() -> Self {
        Self {
            task: None,
            evaluators: Vec::new(),
            summaries: Vec::new(),
            retry: None,
            spans: None,
        }
    }

    /// Set the task under test.
    pub fn task(mut self, task: Arc<dyn Task>) -> Self {
        self.task = Some(task);
        self
    }

    /// Register an async row evaluator.
    pub fn evaluator(mut self, evaluator: Arc<dyn AsyncRowEvaluator>) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    /// Register a synchronous row evaluator.
    pub fn sync_evaluator<E>(self, evaluator: E) -> Self
    where
        E: tally_core::RowEvaluator + 'static,
    {
        self.evaluator(Arc::new(crate::evaluator::SyncEvaluator::new(evaluator)))
    }

    pub fn summary(mut self, evaluator: Arc<dyn SummaryEvaluator>) -> Self {
        self.summaries.push(evaluator);
        self
    }

    /// Override the retry policy derived from each run's config.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Share a span ledger across controllers or with a feedback channel.
    pub fn span_ledger(mut self, ledger: Arc<SpanLedger>) -> Self {
        self.spans = Some(ledger);
        self
    }

    /// Build the controller. Duplicate evaluator names fail here, before
    /// any record runs.
    pub fn build(self) -> Result<ExperimentController, RuntimeError> {
        let task = self.task.ok_or(RuntimeError::TaskNotConfigured)?;

        let mut evaluators = EvaluatorRegistry::new();
        for evaluator in self.evaluators {
            evaluators.register(evaluator)?;
        }
        let mut summaries = SummaryAggregator::new();
        for summary in self.summaries {
            summaries.register(summary)?;
        }

        Ok(ExperimentController {
            task,
            evaluators,
            summaries,
            retry: self.retry,
            spans: self.spans.unwrap_or_default(),
        })
    }
}

impl Default for ExperimentControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::task_fn;
    use serde_json::json;
    use tally_core::{ExactMatch, Record, RecordStatus, Score};

    fn paris_task() -> Arc<dyn Task> {
        Arc::new(task_fn(|_input, _config| async move { Ok(json!("Paris")) }))
    }

    #[test]
    fn test_builder_requires_task() {
        let err = ExperimentController::builder().build().err().unwrap();
        assert!(matches!(err, RuntimeError::TaskNotConfigured));
    }

    #[test]
    fn test_duplicate_evaluator_fails_at_build() {
        let err = ExperimentController::builder()
            .task(paris_task())
            .sync_evaluator(ExactMatch::new())
            .sync_evaluator(ExactMatch::new())
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RuntimeError::Registry(RegistryError::DuplicateName(name)) if name == "exact_match"
        ));
    }

    #[tokio::test]
    async fn test_exact_match_is_case_sensitive() {
        let snapshot = Arc::new(DatasetSnapshot {
            name: "capitals".to_string(),
            version: 0,
            records: vec![
                Record::with_id("upper", json!({"country": "France"})).expected(json!("Paris")),
                Record::with_id("lower", json!({"country": "France"})).expected(json!("paris")),
            ],
            created_at: Utc::now(),
        });
        let controller = ExperimentController::builder()
            .task(paris_task())
            .sync_evaluator(ExactMatch::new())
            .build()
            .unwrap();

        let report = controller.run(snapshot, &RunConfig::default()).await.unwrap();

        let value = |id: &str| {
            report.record(id).unwrap().evaluations[0]
                .result()
                .map(|r| r.value.clone())
        };
        assert_eq!(value("upper"), Some(Score::Bool(true)));
        assert_eq!(value("lower"), Some(Score::Bool(false)));
        assert_eq!(report.record("upper").unwrap().status, RecordStatus::Succeeded);
        assert_eq!(controller.spans().len(), 2);
    }
}
