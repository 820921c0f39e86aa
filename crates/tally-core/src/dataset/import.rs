//! Delimited tabular import.
//!
//! Columns are explicitly assigned to `input_data` or `expected_output`;
//! every other column lands in `metadata`. Cell values are kept as strings.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::Record;

/// Largest accepted cell, in bytes.
pub const MAX_FIELD_BYTES: usize = 10 * 1024 * 1024;

/// Errors raised while importing delimited input.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Failed to read input: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed delimited input: {0}")]
    Csv(#[from] csv::Error),

    #[error("A header row is required")]
    MissingHeader,

    #[error("At least one input_data column must be assigned")]
    NoInputColumns,

    #[error("Column '{0}' is not present in the header row")]
    UnknownColumn(String),

    #[error("Column '{0}' is assigned to more than one role")]
    ConflictingRole(String),

    #[error("Field in column '{column}' at row {row} is {size} bytes, over the {limit} byte limit")]
    FieldTooLarge {
        column: String,
        row: usize,
        size: usize,
        limit: usize,
    },

    #[error("Row {row} has an empty id in column '{column}'")]
    MissingId { column: String, row: usize },

    #[error("Row {row} repeats id '{id}'")]
    DuplicateId { id: String, row: usize },
}

/// Column to role assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnRoles {
    /// Columns copied into `input_data`
    pub input: Vec<String>,

    /// Columns copied into `expected_output`
    #[serde(default)]
    pub expected: Vec<String>,

    /// Column holding the record id; ids are generated when absent
    #[serde(default)]
    pub id: Option<String>,

    /// Field delimiter
    #[serde(default = "default_delimiter")]
    pub delimiter: u8,
}

fn default_delimiter() -> u8 {
    b','
}

impl ColumnRoles {
    pub fn new<I, S>(input: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            input: input.into_iter().map(Into::into).collect(),
            expected: Vec::new(),
            id: None,
            delimiter: default_delimiter(),
        }
    }

    pub fn expected<I, S>(mut self, expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected = expected.into_iter().map(Into::into).collect();
        self
    }

    pub fn id_column(mut self, column: impl Into<String>) -> Self {
        self.id = Some(column.into());
        self
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn check_against(&self, headers: &[String]) -> Result<(), ImportError> {
        if self.input.is_empty() {
            return Err(ImportError::NoInputColumns);
        }

        let mut assigned = HashSet::new();
        let all = self
            .input
            .iter()
            .chain(self.expected.iter())
            .chain(self.id.iter());
        for column in all {
            if !headers.contains(column) {
                return Err(ImportError::UnknownColumn(column.clone()));
            }
            if !assigned.insert(column) {
                return Err(ImportError::ConflictingRole(column.clone()));
            }
        }
        Ok(())
    }
}

/// Import records from a delimited file.
pub fn import_csv_path(path: impl AsRef<Path>, roles: &ColumnRoles) -> Result<Vec<Record>, ImportError> {
    let file = File::open(path)?;
    import_csv(file, roles)
}

/// Import records from any reader. Rows keep file order.
pub fn import_csv<R: Read>(reader: R, roles: &ColumnRoles) -> Result<Vec<Record>, ImportError> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(roles.delimiter)
        .has_headers(true)
        .from_reader(reader);

    let headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(ImportError::MissingHeader);
    }
    roles.check_against(&headers)?;

    let mut records = Vec::new();
    let mut seen_ids = HashSet::new();
    for (row, result) in rdr.records().enumerate() {
        let row_number = row + 1;
        let row = result?;

        let mut input = Map::new();
        let mut expected = Map::new();
        let mut metadata = Map::new();
        let mut id = None;

        for (column, field) in headers.iter().zip(row.iter()) {
            if field.len() > MAX_FIELD_BYTES {
                return Err(ImportError::FieldTooLarge {
                    column: column.clone(),
                    row: row_number,
                    size: field.len(),
                    limit: MAX_FIELD_BYTES,
                });
            }

            let value = Value::String(field.to_string());
            if roles.id.as_ref() == Some(column) {
                if field.trim().is_empty() {
                    return Err(ImportError::MissingId {
                        column: column.clone(),
                        row: row_number,
                    });
                }
                if !seen_ids.insert(field.to_string()) {
                    return Err(ImportError::DuplicateId {
                        id: field.to_string(),
                        row: row_number,
                    });
                }
                id = Some(field.to_string());
            } else if roles.input.contains(column) {
                input.insert(column.clone(), value);
            } else if roles.expected.contains(column) {
                expected.insert(column.clone(), value);
            } else {
                metadata.insert(column.clone(), value);
            }
        }

        let mut record = match id {
            Some(id) => Record::with_id(id, Value::Object(input)),
            None => Record::new(Value::Object(input)),
        };
        if !roles.expected.is_empty() {
            record.expected_output = Some(Value::Object(expected));
        }
        if !metadata.is_empty() {
            record.metadata = Some(Value::Object(metadata));
        }
        records.push(record);
    }

    tracing::debug!(records = records.len(), columns = headers.len(), "Imported delimited input");
    Ok(records)
}
