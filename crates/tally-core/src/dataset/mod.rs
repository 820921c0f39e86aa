//! Versioned datasets.
//!
//! A dataset is a named, ordered collection of [`Record`]s. Readers only ever
//! see committed [`DatasetSnapshot`]s; writers stage edits locally and
//! publish them with a commit. Structural edits (append, delete, or a change
//! to `input_data` / `expected_output`) bump the version, metadata-only edits
//! do not.

pub mod import;
mod record;
mod store;
mod versioned;

pub use import::{import_csv, import_csv_path, ColumnRoles, ImportError, MAX_FIELD_BYTES};
pub use record::{Record, RecordPatch};
pub use store::{DatasetStore, StoreError};
pub use versioned::{DatasetSnapshot, StagedEdit, VersionedDataset, RETENTION_DAYS};

use thiserror::Error;

/// Errors raised by version lookups and commits.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatasetVersionError {
    #[error("Dataset '{name}' has no retained version {version}")]
    NotFound { name: String, version: u64 },

    #[error("Commit conflict on '{name}': expected version {expected}, current is {actual}")]
    Conflict {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("Index {index} out of range for {len} staged records")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Dataset name already registered: {0}")]
    DuplicateName(String),

    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("Dataset name must not be empty")]
    EmptyName,
}
