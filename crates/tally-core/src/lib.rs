//! # tally-core
//!
//! Deterministic building blocks for evaluation runs.
//!
//! This crate holds everything that does not need an async runtime:
//! - versioned datasets and CSV import
//! - the evaluator value model and the built-in row evaluators
//! - summary aggregation over a finished run
//! - the ballot consistency validator
//! - span linkage for out-of-band feedback
//! - run reports
//!
//! ## Example
//!
//! ```rust,ignore
//! use tally_core::{DatasetStore, Record, ExactMatch, RowEvaluator};
//! use serde_json::json;
//!
//! let store = DatasetStore::new();
//! store.create("capitals", vec![
//!     Record::new(json!({"country": "France"})).expected(json!("Paris")),
//! ])?;
//!
//! let snapshot = store.resolve("capitals", None)?;
//! let exact = ExactMatch::new();
//! for record in &snapshot.records {
//!     let out = exact.evaluate(&record.input_data, &json!("Paris"), record.expected_output.as_ref())?;
//!     println!("{}: {:?}", record.id, out.score());
//! }
//! ```

pub mod consistency;
pub mod dataset;
pub mod evaluation;
pub mod evaluators;
pub mod report;
pub mod span;
pub mod summary;

// Re-export main types at crate root
pub use consistency::{BallotConsistency, CheckType, FormType, ValidationCheck};
pub use dataset::{
    ColumnRoles, DatasetSnapshot, DatasetStore, DatasetVersionError, ImportError, Record,
    RecordPatch, StagedEdit, StoreError, VersionedDataset,
};
pub use evaluation::{
    Assessment, EvaluationCell, EvaluationResult, EvaluatorError, EvaluatorOutput, MetricKind,
    MetricKindLedger, RichResult, Score,
};
pub use evaluators::{from_fn, ExactMatch, FnEvaluator, RegistryError, RowEvaluator};
pub use report::{
    ExecutionRecord, ExperimentReport, RecordReport, RecordStatus, ReportError, RunMetadata,
    StatusCounts, TaskError,
};
pub use span::{
    Feedback, FeedbackSubmission, ReferenceIssue, SpanContext, SpanEntry, SpanError, SpanId,
    SpanLedger, TraceId,
};
pub use summary::{
    metric_aggregates, EvaluatorResults, FnSummaryEvaluator, MetricAggregate, PassRate,
    SummaryAggregator, SummaryCell, SummaryEvaluator, SummaryEvaluatorError, SummaryInput,
    SummaryResult,
};

use std::any::Any;

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
