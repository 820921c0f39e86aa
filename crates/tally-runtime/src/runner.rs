//! Bounded-concurrency task execution.
//!
//! `jobs` workers pull records from a shared queue and run the task, the
//! retry policy and the row evaluators for each one. Completion order is
//! free; the returned outcomes are always in dispatch order.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tally_core::{panic_message, DatasetSnapshot, ExecutionRecord, Record, SpanContext, TaskError};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::registry::{EvaluatorRegistry, RawEvaluation};
use crate::resilience::RetryPolicy;
use crate::task::Task;

/// What one worker produced for one record.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    /// Position in the dispatched sequence, which is also dataset order
    pub index: usize,
    pub span: SpanContext,
    pub execution: ExecutionRecord,
    /// Empty when the task failed
    pub evaluations: Vec<RawEvaluation>,
}

/// Outcomes of a runner pass, in dispatch order.
#[derive(Debug, Clone)]
pub struct RunnerOutput {
    pub outcomes: Vec<RecordOutcome>,
    /// Records that were selected for the run
    pub dispatched: usize,
    /// The first task error, when the run stopped early
    pub aborted: Option<(String, TaskError)>,
}

/// Runs a task once per record with at most `jobs` in flight.
#[derive(Clone)]
pub struct TaskRunner {
    task: Arc<dyn Task>,
    evaluators: EvaluatorRegistry,
    retry: RetryPolicy,
    jobs: usize,
    sample_size: Option<usize>,
    raise_errors: bool,
    task_timeout: Option<Duration>,
}

impl TaskRunner {
    pub fn new(task: Arc<dyn Task>) -> Self {
        Self {
            task,
            evaluators: EvaluatorRegistry::new(),
            retry: RetryPolicy::none(),
            jobs: 1,
            sample_size: None,
            raise_errors: false,
            task_timeout: None,
        }
    }

    pub fn evaluators(mut self, evaluators: EvaluatorRegistry) -> Self {
        self.evaluators = evaluators;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Keep only the first `n` records, in dataset order.
    pub fn sample_size(mut self, n: Option<usize>) -> Self {
        self.sample_size = n;
        self
    }

    pub fn raise_errors(mut self, raise: bool) -> Self {
        self.raise_errors = raise;
        self
    }

    pub fn task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Run the task over `snapshot`, passing `config` verbatim to every call.
    pub async fn run(&self, snapshot: &DatasetSnapshot, config: &Value) -> RunnerOutput {
        let limit = self.sample_size.unwrap_or(usize::MAX);
        let selected: VecDeque<(usize, Record)> = snapshot
            .records
            .iter()
            .take(limit)
            .cloned()
            .enumerate()
            .collect();
        let dispatched = selected.len();

        let worker = Arc::new(Worker {
            task: self.task.clone(),
            evaluators: self.evaluators.clone(),
            retry: self.retry.clone(),
            task_timeout: self.task_timeout,
            config: config.clone(),
        });
        let queue = Arc::new(Mutex::new(selected));
        let (tx, mut rx) = mpsc::unbounded_channel::<RecordOutcome>();

        let mut workers = JoinSet::new();
        let raise_errors = self.raise_errors;
        for worker_id in 0..self.jobs.min(dispatched) {
            let worker = worker.clone();
            let queue = queue.clone();
            let tx = tx.clone();
            workers.spawn(
                async move {
                    loop {
                        let next = queue.lock().pop_front();
                        let Some((index, record)) = next else { break };
                        let outcome = worker.process(index, record).await;
                        // Stop dispatch here too; the collector may not be polled yet.
                        if raise_errors && !outcome.execution.is_success() {
                            queue.lock().clear();
                        }
                        if tx.send(outcome).is_err() {
                            break;
                        }
                    }
                }
                .instrument(tracing::debug_span!("worker", worker_id)),
            );
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(dispatched);
        let mut aborted = None;
        while let Some(outcome) = rx.recv().await {
            let failure = outcome
                .execution
                .error
                .clone()
                .filter(|_| self.raise_errors)
                .map(|e| (outcome.execution.record_id.clone(), e));
            outcomes.push(outcome);
            if let Some(failure) = failure {
                aborted = Some(failure);
                break;
            }
        }

        if let Some((record_id, error)) = &aborted {
            tracing::warn!(record_id = %record_id, error = %error, "Aborting run at first task error");
            queue.lock().clear();
            workers.abort_all();
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!(error = %e, "Worker panicked");
                }
            }
        }
        // Results that landed while cancelling are still valid
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }

        outcomes.sort_by_key(|o| o.index);
        RunnerOutput {
            outcomes,
            dispatched,
            aborted,
        }
    }
}

struct Worker {
    task: Arc<dyn Task>,
    evaluators: EvaluatorRegistry,
    retry: RetryPolicy,
    task_timeout: Option<Duration>,
    config: Value,
}

impl Worker {
    async fn process(&self, index: usize, record: Record) -> RecordOutcome {
        let span = SpanContext::mint();
        let record_span = tracing::info_span!(
            "record",
            index,
            record_id = %record.id,
            trace_id = %span.trace_id,
            span_id = %span.span_id,
        );

        async move {
            let started = Instant::now();
            let (result, attempts) = self.retry.run(|| self.attempt(&record)).await;
            let duration = started.elapsed();

            match result {
                Ok(output) => {
                    let evaluations = self.evaluators.evaluate(&record, &output).await;
                    tracing::debug!(attempts, duration_ms = duration.as_millis() as u64, "Record completed");
                    RecordOutcome {
                        index,
                        span,
                        execution: ExecutionRecord::succeeded(record.id, output, duration, attempts),
                        evaluations,
                    }
                }
                Err(error) => {
                    tracing::warn!(attempts, error = %error, "Task failed");
                    RecordOutcome {
                        index,
                        span,
                        execution: ExecutionRecord::failed(record.id, error, duration, attempts),
                        evaluations: Vec::new(),
                    }
                }
            }
        }
        .instrument(record_span)
        .await
    }

    async fn attempt(&self, record: &Record) -> Result<Value, TaskError> {
        let call = AssertUnwindSafe(self.task.run(&record.input_data, &self.config)).catch_unwind();

        let caught = match self.task_timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| TaskError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })?,
            None => call.await,
        };

        caught.unwrap_or_else(|payload| {
            Err(TaskError::Panicked {
                message: panic_message(payload.as_ref()),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::task_fn;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot(n: usize) -> DatasetSnapshot {
        DatasetSnapshot {
            name: "numbers".to_string(),
            version: 0,
            records: (0..n)
                .map(|i| Record::with_id(format!("r{}", i), json!({"n": i})))
                .collect(),
            created_at: Utc::now(),
        }
    }

    fn doubling() -> Arc<dyn Task> {
        Arc::new(task_fn(|input, _config| async move {
            let n = input["n"].as_u64().unwrap_or(0);
            // later records finish first
            tokio::time::sleep(Duration::from_millis(50 - n)).await;
            Ok(json!(n * 2))
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_dataset_order() {
        let out = TaskRunner::new(doubling()).jobs(4).run(&snapshot(10), &Value::Null).await;

        assert_eq!(out.outcomes.len(), 10);
        for (i, outcome) in out.outcomes.iter().enumerate() {
            assert_eq!(outcome.index, i);
            assert_eq!(outcome.execution.record_id, format!("r{}", i));
            assert_eq!(outcome.execution.output, Some(json!(i * 2)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_size_is_a_prefix() {
        let out = TaskRunner::new(doubling())
            .jobs(3)
            .sample_size(Some(4))
            .run(&snapshot(10), &Value::Null)
            .await;
        let ids: Vec<_> = out.outcomes.iter().map(|o| o.execution.record_id.as_str()).collect();
        assert_eq!(ids, vec!["r0", "r1", "r2", "r3"]);
        assert_eq!(out.dispatched, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());
        let task = task_fn(move |_input, _config| {
            let (a, p) = (a.clone(), p.clone());
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });

        TaskRunner::new(Arc::new(task)).jobs(3).run(&snapshot(12), &Value::Null).await;
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_by_default() {
        let task = task_fn(|input, _config| async move {
            if input["n"] == json!(2) {
                Err(TaskError::failed("model refused"))
            } else {
                Ok(json!("ok"))
            }
        });
        let out = TaskRunner::new(Arc::new(task)).jobs(2).run(&snapshot(5), &Value::Null).await;

        assert!(out.aborted.is_none());
        assert_eq!(out.outcomes.len(), 5);
        assert_eq!(
            out.outcomes[2].execution.error,
            Some(TaskError::failed("model refused"))
        );
        assert!(out.outcomes[2].execution.output.is_none());
    }

    #[tokio::test]
    async fn test_panics_and_timeouts_are_recorded() {
        let task = task_fn(|input, _config| async move {
            match input["n"].as_u64() {
                Some(0) => panic!("tokenizer exploded"),
                Some(1) => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!("late"))
                }
                _ => Ok(json!("ok")),
            }
        });
        let out = TaskRunner::new(Arc::new(task))
            .jobs(3)
            .task_timeout(Some(Duration::from_millis(20)))
            .run(&snapshot(3), &Value::Null)
            .await;

        assert!(matches!(
            &out.outcomes[0].execution.error,
            Some(TaskError::Panicked { message }) if message.contains("tokenizer exploded")
        ));
        assert_eq!(
            out.outcomes[1].execution.error,
            Some(TaskError::Timeout { timeout_ms: 20 })
        );
        assert!(out.outcomes[2].execution.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_raise_errors_stops_dispatch() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = started.clone();
        let task = task_fn(move |input, _config| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let n = input["n"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(10)).await;
                if n == 1 {
                    Err(TaskError::failed("bad form"))
                } else {
                    Ok(json!(n))
                }
            }
        });

        let out = TaskRunner::new(Arc::new(task))
            .jobs(1)
            .raise_errors(true)
            .run(&snapshot(6), &Value::Null)
            .await;

        let (record_id, error) = out.aborted.unwrap();
        assert_eq!(record_id, "r1");
        assert_eq!(error, TaskError::failed("bad form"));
        assert_eq!(out.outcomes.len(), 2);
        assert!(out.outcomes[0].execution.is_success());
        assert!(started.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_retry_counts_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let task = task_fn(move |_input, _config| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TaskError::failed("rate limited"))
                } else {
                    Ok(json!("ok"))
                }
            }
        });

        let retry = RetryPolicy::none()
            .max_attempts(3)
            .backoff(Duration::from_millis(1), Duration::from_millis(1));
        let out = TaskRunner::new(Arc::new(task))
            .retry(retry)
            .run(&snapshot(1), &Value::Null)
            .await;

        assert_eq!(out.outcomes[0].execution.attempts, 2);
        assert!(out.outcomes[0].execution.is_success());
    }

    type Row = (usize, String, Option<Value>);

    fn rows(out: RunnerOutput) -> Vec<Row> {
        out.outcomes
            .into_iter()
            .map(|o| (o.index, o.execution.record_id, o.execution.output))
            .collect()
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        #[test]
        fn prop_parallel_matches_sequential(
            delays in proptest::collection::vec(0u64..20, 0..24),
            jobs in 2usize..12,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let records = snapshot(delays.len());
            let delays = Arc::new(delays);
            let task: Arc<dyn Task> = Arc::new(task_fn(move |input, _config| {
                let delays = delays.clone();
                async move {
                    let n = input["n"].as_u64().unwrap_or(0) as usize;
                    tokio::time::sleep(Duration::from_millis(delays[n])).await;
                    Ok(json!(n * 3))
                }
            }));

            let baseline = rt.block_on(TaskRunner::new(task.clone()).jobs(1).run(&records, &Value::Null));
            let parallel = rt.block_on(TaskRunner::new(task).jobs(jobs).run(&records, &Value::Null));
            proptest::prop_assert_eq!(rows(parallel), rows(baseline));
        }
    }
}
