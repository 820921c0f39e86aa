//! Span linkage.
//!
//! Every task execution gets a [`SpanContext`] minted at its start. The
//! evaluation results for that record are attached to it in a
//! [`SpanLedger`], and human feedback submitted later, possibly from another
//! process, is joined on the same pair of identifiers.
//!
//! Identifiers cross the process boundary as plain strings. A submission
//! that names a malformed or unknown pair is rejected with
//! [`SpanError::InvalidSpanReference`]; it is never dropped or attached
//! elsewhere.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::evaluation::EvaluationCell;

lazy_static! {
    static ref TRACE_ID_PATTERN: Regex = Regex::new(r"^[0-9a-f]{32}$").unwrap();
    static ref SPAN_ID_PATTERN: Regex = Regex::new(r"^[0-9a-f]{16}$").unwrap();
}

/// Why a span reference could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceIssue {
    Malformed,
    Unknown,
}

impl fmt::Display for ReferenceIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceIssue::Malformed => write!(f, "malformed identifier"),
            ReferenceIssue::Unknown => write!(f, "no execution was recorded under this span"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SpanError {
    #[error("Invalid span reference '{reference}': {issue}")]
    InvalidSpanReference {
        reference: String,
        issue: ReferenceIssue,
    },

    #[error("Invalid feedback: {0}")]
    InvalidFeedback(String),

    #[error("Failed to access span ledger: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode span ledger: {0}")]
    Json(#[from] serde_json::Error),
}

impl SpanError {
    fn malformed(reference: impl Into<String>) -> Self {
        SpanError::InvalidSpanReference {
            reference: reference.into(),
            issue: ReferenceIssue::Malformed,
        }
    }

    pub fn is_invalid_reference(&self) -> bool {
        matches!(self, SpanError::InvalidSpanReference { .. })
    }
}

macro_rules! hex_id {
    ($(#[$doc:meta])* $name:ident, $pattern:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> Result<Self, SpanError> {
                if $pattern.is_match(raw) {
                    Ok(Self(raw.to_string()))
                } else {
                    Err(SpanError::malformed(raw))
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = SpanError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Self::parse(raw)
            }
        }

        impl TryFrom<String> for $name {
            type Error = SpanError;

            fn try_from(raw: String) -> Result<Self, Self::Error> {
                Self::parse(&raw)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

hex_id!(
    /// 32 lowercase hex characters.
    TraceId,
    TRACE_ID_PATTERN
);
hex_id!(
    /// 16 lowercase hex characters.
    SpanId,
    SPAN_ID_PATTERN
);

/// The join key between one task execution and its later feedback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

impl SpanContext {
    /// Mint a fresh pair.
    pub fn mint() -> Self {
        let trace = Uuid::new_v4().simple().to_string();
        let span = Uuid::new_v4().simple().to_string();
        Self {
            trace_id: TraceId(trace),
            span_id: SpanId(span[..16].to_string()),
        }
    }

    /// Parse a pair received from outside the process.
    pub fn parse(trace_id: &str, span_id: &str) -> Result<Self, SpanError> {
        Ok(Self {
            trace_id: TraceId::parse(trace_id)?,
            span_id: SpanId::parse(span_id)?,
        })
    }
}

impl fmt::Display for SpanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.trace_id, self.span_id)
    }
}

/// Feedback as it arrives from the external channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackSubmission {
    pub trace_id: String,
    pub span_id: String,
    pub feedback_type: String,
    pub value: Value,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Feedback accepted onto a span.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feedback {
    pub id: String,
    pub feedback_type: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Everything linked to one span.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanEntry {
    pub span: SpanContext,
    pub run_id: String,
    pub record_id: String,
    pub results: Vec<EvaluationCell>,
    #[serde(default)]
    pub feedback: Vec<Feedback>,
    pub attached_at: DateTime<Utc>,
}

/// Durable span → results/feedback index.
#[derive(Default)]
pub struct SpanLedger {
    entries: RwLock<BTreeMap<SpanContext, SpanEntry>>,
}

impl SpanLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link `results` for one record execution to `span`.
    ///
    /// Attaching to a span that already has an entry appends to it.
    pub fn attach(
        &self,
        span: &SpanContext,
        run_id: &str,
        record_id: &str,
        results: &[EvaluationCell],
    ) {
        let mut entries = self.entries.write();
        entries
            .entry(span.clone())
            .and_modify(|entry| entry.results.extend_from_slice(results))
            .or_insert_with(|| SpanEntry {
                span: span.clone(),
                run_id: run_id.to_string(),
                record_id: record_id.to_string(),
                results: results.to_vec(),
                feedback: Vec::new(),
                attached_at: Utc::now(),
            });
    }

    /// Accept feedback from outside the process.
    pub fn submit_external(&self, submission: FeedbackSubmission) -> Result<Feedback, SpanError> {
        let span = SpanContext::parse(&submission.trace_id, &submission.span_id)?;
        if submission.feedback_type.trim().is_empty() {
            return Err(SpanError::InvalidFeedback(
                "feedback_type must not be empty".to_string(),
            ));
        }

        let feedback = Feedback {
            id: Uuid::new_v4().to_string(),
            feedback_type: submission.feedback_type,
            value: submission.value,
            reasoning: submission.reasoning,
            tags: submission.tags,
            submitted_at: Utc::now(),
        };

        let mut entries = self.entries.write();
        let entry = entries.get_mut(&span).ok_or_else(|| unknown(&span))?;
        entry.feedback.push(feedback.clone());
        tracing::info!(span = %span, feedback_type = %feedback.feedback_type, "Feedback attached");
        Ok(feedback)
    }

    /// Look up a span by its string identifiers.
    pub fn resolve(&self, trace_id: &str, span_id: &str) -> Result<SpanEntry, SpanError> {
        let span = SpanContext::parse(trace_id, span_id)?;
        self.entries
            .read()
            .get(&span)
            .cloned()
            .ok_or_else(|| unknown(&span))
    }

    pub fn feedback_for(&self, span: &SpanContext) -> Result<Vec<Feedback>, SpanError> {
        self.entries
            .read()
            .get(span)
            .map(|entry| entry.feedback.clone())
            .ok_or_else(|| unknown(span))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Fold another ledger's entries into this one.
    ///
    /// Entries for the same span are unioned: results and feedback already
    /// held here are kept and only unseen ones are appended.
    pub fn merge(&self, other: SpanLedger) {
        let mut entries = self.entries.write();
        for (span, incoming) in other.entries.into_inner() {
            match entries.get_mut(&span) {
                Some(entry) => {
                    for cell in incoming.results {
                        if !entry.results.contains(&cell) {
                            entry.results.push(cell);
                        }
                    }
                    for feedback in incoming.feedback {
                        if entry.feedback.iter().all(|f| f.id != feedback.id) {
                            entry.feedback.push(feedback);
                        }
                    }
                }
                None => {
                    entries.insert(span, incoming);
                }
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SpanError> {
        let entries: Vec<SpanEntry> = self.entries.read().values().cloned().collect();
        let json = serde_json::to_string_pretty(&entries)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SpanError> {
        let contents = fs::read_to_string(path)?;
        let entries: Vec<SpanEntry> = serde_json::from_str(&contents)?;
        Ok(Self {
            entries: RwLock::new(
                entries
                    .into_iter()
                    .map(|entry| (entry.span.clone(), entry))
                    .collect(),
            ),
        })
    }

    /// Load `path` if it exists, otherwise start empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SpanError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }
}

fn unknown(span: &SpanContext) -> SpanError {
    SpanError::InvalidSpanReference {
        reference: span.to_string(),
        issue: ReferenceIssue::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission(span: &SpanContext) -> FeedbackSubmission {
        FeedbackSubmission {
            trace_id: span.trace_id.to_string(),
            span_id: span.span_id.to_string(),
            feedback_type: "human_review".to_string(),
            value: json!(true),
            reasoning: Some("totals look right".to_string()),
            tags: vec!["reviewed".to_string()],
        }
    }

    #[test]
    fn test_minted_ids_are_well_formed() {
        let span = SpanContext::mint();
        assert_eq!(span.trace_id.as_str().len(), 32);
        assert_eq!(span.span_id.as_str().len(), 16);
        assert!(SpanContext::parse(span.trace_id.as_str(), span.span_id.as_str()).is_ok());
        assert_ne!(span, SpanContext::mint());
    }

    #[test]
    fn test_feedback_on_attached_span() {
        let ledger = SpanLedger::new();
        let span = SpanContext::mint();
        ledger.attach(&span, "run-1", "r1", &[]);

        let feedback = ledger.submit_external(submission(&span)).unwrap();
        assert_eq!(feedback.feedback_type, "human_review");
        assert_eq!(ledger.feedback_for(&span).unwrap(), vec![feedback]);
    }

    #[test]
    fn test_unknown_span_is_rejected() {
        let ledger = SpanLedger::new();
        ledger.attach(&SpanContext::mint(), "run-1", "r1", &[]);

        let never_minted = SpanContext::mint();
        let err = ledger.submit_external(submission(&never_minted)).unwrap_err();
        assert!(matches!(
            err,
            SpanError::InvalidSpanReference {
                issue: ReferenceIssue::Unknown,
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_span_is_rejected() {
        let ledger = SpanLedger::new();
        let span = SpanContext::mint();
        ledger.attach(&span, "run-1", "r1", &[]);

        let mut bad = submission(&span);
        bad.span_id = "ABCDEF0123456789".to_string();
        let err = ledger.submit_external(bad).unwrap_err();
        assert!(matches!(
            err,
            SpanError::InvalidSpanReference {
                issue: ReferenceIssue::Malformed,
                ..
            }
        ));
        assert!(ledger.feedback_for(&span).unwrap().is_empty());
    }

    #[test]
    fn test_mismatched_trace_does_not_attach() {
        let ledger = SpanLedger::new();
        let span = SpanContext::mint();
        ledger.attach(&span, "run-1", "r1", &[]);

        let mut crossed = submission(&span);
        crossed.trace_id = SpanContext::mint().trace_id.to_string();
        assert!(ledger.submit_external(crossed).unwrap_err().is_invalid_reference());
    }

    #[test]
    fn test_feedback_accepted_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spans.json");
        let span = SpanContext::mint();

        {
            let ledger = SpanLedger::new();
            ledger.attach(&span, "run-1", "r1", &[]);
            ledger.save(&path).unwrap();
        }

        let reloaded = SpanLedger::load(&path).unwrap();
        reloaded.submit_external(submission(&span)).unwrap();
        let entry = reloaded
            .resolve(span.trace_id.as_str(), span.span_id.as_str())
            .unwrap();
        assert_eq!(entry.record_id, "r1");
        assert_eq!(entry.feedback.len(), 1);
    }

    #[test]
    fn test_merge_keeps_accepted_feedback() {
        let span = SpanContext::mint();
        let ledger = SpanLedger::new();
        ledger.attach(&span, "run-1", "r1", &[]);
        let kept = ledger.submit_external(submission(&span)).unwrap();

        let other = SpanLedger::new();
        other.attach(&span, "run-1", "r1", &[]);
        let late = other.submit_external(submission(&span)).unwrap();
        let fresh = SpanContext::mint();
        other.attach(&fresh, "run-2", "r9", &[]);

        ledger.merge(other);
        assert_eq!(ledger.feedback_for(&span).unwrap(), vec![kept, late]);
        assert_eq!(ledger.resolve(fresh.trace_id.as_str(), fresh.span_id.as_str()).unwrap().record_id, "r9");
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_merge_with_own_copy_adds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spans.json");
        let span = SpanContext::mint();
        let ledger = SpanLedger::new();
        ledger.attach(&span, "run-1", "r1", &[]);
        ledger.submit_external(submission(&span)).unwrap();
        ledger.save(&path).unwrap();

        ledger.merge(SpanLedger::load(&path).unwrap());
        assert_eq!(ledger.feedback_for(&span).unwrap().len(), 1);
    }

    #[test]
    fn test_span_ids_reject_bad_json() {
        let err = serde_json::from_value::<SpanContext>(json!({
            "trace_id": "not-hex",
            "span_id": "0123456789abcdef"
        }));
        assert!(err.is_err());
    }
}
