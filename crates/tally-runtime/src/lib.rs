//! # tally-runtime
//!
//! Async execution for tally experiments.
//!
//! `tally-core` holds the deterministic pieces. This crate runs a task
//! against a pinned dataset snapshot with bounded parallelism, executes the
//! row evaluators for each record, and hands the results to the summary
//! aggregator.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_core::{DatasetStore, ExactMatch, PassRate};
//! use tally_runtime::{task_fn, ExperimentController, RunConfig};
//!
//! let controller = ExperimentController::builder()
//!     .task(Arc::new(task_fn(|input, config| async move { call_model(input, config).await })))
//!     .sync_evaluator(ExactMatch::new())
//!     .summary(Arc::new(PassRate::new("exact_match")))
//!     .build()?;
//!
//! let config = RunConfig::from_yaml_file("run.yaml")?;
//! let report = controller.run_dataset(&store, "capitals", None, &config).await?;
//! report.save_to_dir("reports")?;
//! ```

pub mod config;
pub mod evaluator;
pub mod experiment;
pub mod registry;
pub mod resilience;
pub mod runner;
pub mod task;

pub use config::{ConfigError, RetryConfig, RunConfig};
pub use evaluator::{AsyncRowEvaluator, SyncEvaluator};
pub use experiment::{ExperimentController, ExperimentControllerBuilder, RuntimeError};
pub use registry::{EvaluatorRegistry, RawEvaluation};
pub use resilience::RetryPolicy;
pub use runner::{RecordOutcome, RunnerOutput, TaskRunner};
pub use task::{task_fn, FnTask, Task};
