//! Tally CLI
//!
//! The `tally` command manages versioned datasets and runs evaluation
//! experiments over recorded task outputs.
//!
//! ## Commands
//!
//! - `import`: Create a dataset from a delimited file
//! - `dataset`: Inspect stored datasets
//! - `run`: Evaluate recorded outputs and write a report
//! - `feedback`: Attach out-of-band feedback to a run span
//! - `report`: Print a saved report

mod replay;
mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tally_core::dataset::import_csv_path;
use tally_core::{
    BallotConsistency, ColumnRoles, DatasetStore, ExactMatch, ExperimentReport,
    FeedbackSubmission, PassRate, SpanLedger,
};
use tally_runtime::{ExperimentController, RunConfig, RuntimeError};
use tracing::Level;

#[derive(Parser)]
#[command(name = "tally")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Versioned datasets and evaluation runs", long_about = None)]
struct Cli {
    /// Default log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a delimited file as a new dataset
    Import {
        /// Dataset store file
        #[arg(long, default_value = "tally-store.json")]
        store: PathBuf,

        /// Name of the new dataset
        #[arg(long)]
        name: String,

        /// Delimited file with a header row
        file: PathBuf,

        /// Columns copied into input_data
        #[arg(long = "input", required = true)]
        input: Vec<String>,

        /// Columns copied into expected_output
        #[arg(long = "expected")]
        expected: Vec<String>,

        /// Column holding record ids
        #[arg(long)]
        id: Option<String>,

        /// Field delimiter
        #[arg(long, default_value = ",")]
        delimiter: char,
    },

    /// Inspect stored datasets
    Dataset {
        #[command(subcommand)]
        action: DatasetAction,
    },

    /// Evaluate recorded outputs against a dataset
    Run(RunArgs),

    /// Submit feedback for a span from an earlier run
    Feedback {
        /// Span ledger file written by `run`
        #[arg(long, default_value = "tally-spans.json")]
        spans: PathBuf,

        #[arg(long)]
        trace_id: String,

        #[arg(long)]
        span_id: String,

        /// Feedback category, e.g. human_correction
        #[arg(long = "type")]
        feedback_type: String,

        /// Feedback value; parsed as JSON when possible
        #[arg(long)]
        value: String,

        #[arg(long)]
        reasoning: Option<String>,

        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Print a saved report
    Report {
        /// Directory holding reports
        #[arg(long, default_value = "tally-reports")]
        reports_dir: PathBuf,

        /// Run identifier
        run_id: String,
    },
}

#[derive(Subcommand)]
enum DatasetAction {
    /// List dataset names
    List {
        #[arg(long, default_value = "tally-store.json")]
        store: PathBuf,
    },

    /// Show one version of a dataset
    Show {
        #[arg(long, default_value = "tally-store.json")]
        store: PathBuf,

        name: String,

        /// Version to show (default: current)
        #[arg(long)]
        version: Option<u64>,

        /// Records to print
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(long, default_value = "tally-store.json")]
    store: PathBuf,

    /// Dataset to run against
    dataset: String,

    /// Dataset version (default: current)
    #[arg(long)]
    version: Option<u64>,

    /// Run configuration file (YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured parallelism
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Override the configured sample size
    #[arg(long)]
    sample_size: Option<usize>,

    /// Abort at the first task error
    #[arg(long)]
    raise_errors: bool,

    /// Metadata column holding the recorded outputs
    #[arg(long, default_value = "output")]
    output_column: String,

    /// Wrap each recorded output as {NAME: output}
    #[arg(long, value_name = "NAME")]
    wrap_as: Option<String>,

    /// Row evaluators, in execution order
    #[arg(short, long = "evaluator", value_enum, default_values_t = [BuiltinEvaluator::ExactMatch])]
    evaluators: Vec<BuiltinEvaluator>,

    /// Add a pass-rate summary over the named evaluator
    #[arg(long = "pass-rate", value_name = "EVALUATOR")]
    pass_rates: Vec<String>,

    /// Directory for run reports
    #[arg(long, default_value = "tally-reports")]
    reports_dir: PathBuf,

    /// Span ledger file
    #[arg(long, default_value = "tally-spans.json")]
    spans: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BuiltinEvaluator {
    #[value(name = "exact_match")]
    ExactMatch,
    #[value(name = "ballot_consistency")]
    BallotConsistency,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.json, cli.log_level);

    match cli.command {
        Commands::Import {
            store,
            name,
            file,
            input,
            expected,
            id,
            delimiter,
        } => cmd_import(&store, &name, &file, input, expected, id, delimiter),
        Commands::Dataset { action } => match action {
            DatasetAction::List { store } => cmd_dataset_list(&store),
            DatasetAction::Show {
                store,
                name,
                version,
                limit,
            } => cmd_dataset_show(&store, &name, version, limit),
        },
        Commands::Run(args) => cmd_run(args).await,
        Commands::Feedback {
            spans,
            trace_id,
            span_id,
            feedback_type,
            value,
            reasoning,
            tags,
        } => cmd_feedback(
            &spans,
            FeedbackSubmission {
                trace_id,
                span_id,
                feedback_type,
                value: parse_value(&value),
                reasoning,
                tags,
            },
        ),
        Commands::Report {
            reports_dir,
            run_id,
        } => cmd_report(&reports_dir, &run_id),
    }
}

fn cmd_import(
    store_path: &Path,
    name: &str,
    file: &Path,
    input: Vec<String>,
    expected: Vec<String>,
    id: Option<String>,
    delimiter: char,
) -> Result<()> {
    if !delimiter.is_ascii() {
        bail!("Delimiter must be a single ASCII character, got '{}'", delimiter);
    }
    let mut roles = ColumnRoles::new(input)
        .expected(expected)
        .delimiter(delimiter as u8);
    if let Some(id) = id {
        roles = roles.id_column(id);
    }

    let records = import_csv_path(file, &roles)
        .with_context(|| format!("Failed to import {}", file.display()))?;
    let store = DatasetStore::open(store_path)
        .with_context(|| format!("Failed to open store {}", store_path.display()))?;
    let snapshot = store.create(name, records)?;
    store.purge_expired(Utc::now());
    store
        .save(store_path)
        .with_context(|| format!("Failed to save store {}", store_path.display()))?;

    println!(
        "Imported {} records into '{}' (version {})",
        snapshot.len(),
        snapshot.name,
        snapshot.version
    );
    Ok(())
}

fn cmd_dataset_list(store_path: &Path) -> Result<()> {
    let store = DatasetStore::load(store_path)
        .with_context(|| format!("Failed to load store {}", store_path.display()))?;
    for name in store.names() {
        let snapshot = store.current(&name)?;
        println!("{}\tversion {}\t{} records", name, snapshot.version, snapshot.len());
    }
    Ok(())
}

fn cmd_dataset_show(store_path: &Path, name: &str, version: Option<u64>, limit: usize) -> Result<()> {
    let store = DatasetStore::load(store_path)
        .with_context(|| format!("Failed to load store {}", store_path.display()))?;
    let handle = store.dataset(name)?;
    let dataset = handle.read();
    let snapshot = match version {
        Some(v) => dataset.at(v)?,
        None => dataset.current(),
    };

    println!("Dataset:   {}", snapshot.name);
    println!("Version:   {} (current {})", snapshot.version, dataset.version());
    println!("Created:   {}", snapshot.created_at.to_rfc3339());
    println!("Records:   {}", snapshot.len());
    println!("Retained:  {:?}", dataset.retained_versions(Utc::now()));
    for record in snapshot.records.iter().take(limit) {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(())
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_file(path)
            .with_context(|| format!("Failed to load run config {}", path.display()))?,
        None => RunConfig::default(),
    };
    if let Some(jobs) = args.jobs {
        config = config.jobs(jobs);
    }
    if let Some(n) = args.sample_size {
        config = config.sample_size(n);
    }
    if args.raise_errors {
        config = config.raise_errors(true);
    }

    let store = DatasetStore::load(&args.store)
        .with_context(|| format!("Failed to load store {}", args.store.display()))?;
    let snapshot = store.resolve(&args.dataset, args.version)?;
    let outputs = replay::recorded_outputs(
        &snapshot.records,
        &args.output_column,
        args.wrap_as.as_deref(),
    )?;

    let spans = Arc::new(
        SpanLedger::open(&args.spans)
            .with_context(|| format!("Failed to open span ledger {}", args.spans.display()))?,
    );
    let mut builder = ExperimentController::builder()
        .task(Arc::new(replay::replay_task(outputs)))
        .span_ledger(spans.clone());
    for evaluator in &args.evaluators {
        builder = match evaluator {
            BuiltinEvaluator::ExactMatch => builder.sync_evaluator(ExactMatch::new()),
            BuiltinEvaluator::BallotConsistency => builder.sync_evaluator(BallotConsistency::new()),
        };
    }
    for evaluator in &args.pass_rates {
        builder = builder.summary(Arc::new(PassRate::new(evaluator.clone())));
    }
    let controller = builder.build()?;

    let outcome = controller.run(snapshot, &config).await;

    // Persist the last-used time and the spans even for an aborted run.
    store.purge_expired(Utc::now());
    store
        .save(&args.store)
        .with_context(|| format!("Failed to save store {}", args.store.display()))?;
    // Keep feedback that `tally feedback` wrote while the run was in flight.
    if args.spans.exists() {
        let on_disk = SpanLedger::load(&args.spans)
            .with_context(|| format!("Failed to reload span ledger {}", args.spans.display()))?;
        spans.merge(on_disk);
    }
    spans
        .save(&args.spans)
        .with_context(|| format!("Failed to save span ledger {}", args.spans.display()))?;

    match outcome {
        Ok(report) => {
            let path = save_report(&report, &args.reports_dir)?;
            print_report(&report);
            println!("Report written to {}", path.display());
            Ok(())
        }
        Err(RuntimeError::Aborted {
            record_id,
            error,
            report,
        }) => {
            let path = save_report(&report, &args.reports_dir)?;
            print_report(&report);
            bail!(
                "Run aborted at record '{}': {} (partial report at {})",
                record_id,
                error,
                path.display()
            )
        }
        Err(e) => Err(e.into()),
    }
}

fn save_report(report: &ExperimentReport, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    report
        .save_to_dir(dir)
        .with_context(|| format!("Failed to write report to {}", dir.display()))
}

fn cmd_feedback(spans_path: &Path, submission: FeedbackSubmission) -> Result<()> {
    let ledger = SpanLedger::load(spans_path)
        .with_context(|| format!("Failed to load span ledger {}", spans_path.display()))?;
    let feedback = ledger.submit_external(submission)?;
    ledger
        .save(spans_path)
        .with_context(|| format!("Failed to save span ledger {}", spans_path.display()))?;
    println!("{}", serde_json::to_string_pretty(&feedback)?);
    Ok(())
}

fn cmd_report(dir: &Path, run_id: &str) -> Result<()> {
    let report = ExperimentReport::load_from_dir(dir, run_id)
        .with_context(|| format!("Failed to load report {} from {}", run_id, dir.display()))?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &ExperimentReport) {
    let meta = &report.run_metadata;
    let counts = report.status_counts();

    println!("Run:       {}", meta.run_id);
    println!("Dataset:   {} (version {})", meta.dataset_name, meta.dataset_version);
    println!(
        "Records:   {} succeeded, {} partially evaluated, {} failed",
        counts.succeeded, counts.partially_evaluated, counts.failed
    );
    if meta.aborted {
        println!("Status:    aborted");
    }

    if !report.metrics.is_empty() {
        println!("\nMetrics:");
        for metric in &report.metrics {
            let value = metric
                .value
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<24} {:<16} {:>10}  ({} values, {} failed)",
                metric.evaluator_name,
                format!("{:?}", metric.metric_kind),
                value,
                metric.count,
                metric.failed
            );
        }
    }

    if !report.summary.is_empty() {
        println!("\nSummaries:");
        for cell in &report.summary {
            match (cell.value(), cell.error()) {
                (Some(value), _) => println!("  {:<24} {}", cell.evaluator_name(), value),
                (None, Some(error)) => println!("  {:<24} error: {}", cell.evaluator_name(), error),
                (None, None) => println!("  {:<24} -", cell.evaluator_name()),
            }
        }
    }
}

/// JSON when it parses, otherwise the raw string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
