//! Dataset records and update patches.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One input / expected-output / metadata triple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Stable identity across versions of the same dataset
    pub id: String,

    /// Structured input handed to the task
    pub input_data: Value,

    /// Reference output, when the record has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<Value>,

    /// Free-form annotations; editing these never bumps the version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Record {
    /// Create a record with a fresh identifier.
    pub fn new(input_data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            input_data,
            expected_output: None,
            metadata: None,
        }
    }

    /// Create a record with a caller-chosen identifier.
    pub fn with_id(id: impl Into<String>, input_data: Value) -> Self {
        Self {
            id: id.into(),
            ..Self::new(input_data)
        }
    }

    pub fn expected(mut self, expected_output: Value) -> Self {
        self.expected_output = Some(expected_output);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A partial update to a record at a given index.
///
/// Fields left as `None` are untouched. `expected_output` and `metadata`
/// use a nested option so a patch can clear them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub input_data: Option<Value>,
    pub expected_output: Option<Option<Value>>,
    pub metadata: Option<Option<Value>>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_data(mut self, value: Value) -> Self {
        self.input_data = Some(value);
        self
    }

    pub fn expected_output(mut self, value: Value) -> Self {
        self.expected_output = Some(Some(value));
        self
    }

    pub fn clear_expected_output(mut self) -> Self {
        self.expected_output = Some(None);
        self
    }

    pub fn metadata(mut self, value: Value) -> Self {
        self.metadata = Some(Some(value));
        self
    }

    /// Whether applying this patch to `record` changes its input or
    /// expected output. Setting a field to the value it already holds is
    /// not a structural change.
    pub fn is_structural_for(&self, record: &Record) -> bool {
        let input_changed = self
            .input_data
            .as_ref()
            .is_some_and(|input| *input != record.input_data);
        let expected_changed = self
            .expected_output
            .as_ref()
            .is_some_and(|expected| *expected != record.expected_output);
        input_changed || expected_changed
    }

    /// Apply the patch in place. The record id is never changed.
    pub fn apply(&self, record: &mut Record) {
        if let Some(input) = &self.input_data {
            record.input_data = input.clone();
        }
        if let Some(expected) = &self.expected_output {
            record.expected_output = expected.clone();
        }
        if let Some(metadata) = &self.metadata {
            record.metadata = metadata.clone();
        }
    }
}
