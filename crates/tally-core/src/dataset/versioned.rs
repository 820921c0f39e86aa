//! Snapshot versioning with staged edits.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{DatasetVersionError, Record, RecordPatch};

/// Days a superseded snapshot stays retrievable after its last use as a run input.
pub const RETENTION_DAYS: i64 = 90;

/// An immutable, numbered state of a dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetSnapshot {
    pub name: String,
    pub version: u64,
    pub records: Vec<Record>,
    pub created_at: DateTime<Utc>,
}

impl DatasetSnapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A local, uncommitted edit.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedEdit {
    Append(Record),
    Update { index: usize, patch: RecordPatch },
    Delete { index: usize },
}

/// A superseded snapshot and its retention clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RetainedSnapshot {
    pub(crate) snapshot: DatasetSnapshot,
    pub(crate) last_used_at: DateTime<Utc>,
}

/// A named dataset with a single current snapshot and retained history.
///
/// The current pointer is swapped only by [`VersionedDataset::commit`];
/// callers holding an `Arc<DatasetSnapshot>` keep reading the state they
/// were handed.
#[derive(Debug, Clone)]
pub struct VersionedDataset {
    current: Arc<DatasetSnapshot>,
    current_last_used: Option<DateTime<Utc>>,
    history: BTreeMap<u64, RetainedSnapshot>,
    staged: Option<Vec<Record>>,
}

impl VersionedDataset {
    /// Create a dataset at version 0.
    pub fn create(
        name: impl Into<String>,
        records: Vec<Record>,
    ) -> Result<Self, DatasetVersionError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DatasetVersionError::EmptyName);
        }

        Ok(Self {
            current: Arc::new(DatasetSnapshot {
                name,
                version: 0,
                records,
                created_at: Utc::now(),
            }),
            current_last_used: None,
            history: BTreeMap::new(),
            staged: None,
        })
    }

    pub(crate) fn from_parts(
        current: DatasetSnapshot,
        current_last_used: Option<DateTime<Utc>>,
        history: BTreeMap<u64, RetainedSnapshot>,
    ) -> Self {
        Self {
            current: Arc::new(current),
            current_last_used,
            history,
            staged: None,
        }
    }

    pub(crate) fn parts(
        &self,
    ) -> (
        &DatasetSnapshot,
        Option<DateTime<Utc>>,
        &BTreeMap<u64, RetainedSnapshot>,
    ) {
        (&self.current, self.current_last_used, &self.history)
    }

    pub fn name(&self) -> &str {
        &self.current.name
    }

    pub fn version(&self) -> u64 {
        self.current.version
    }

    /// The committed snapshot every consumer sees.
    pub fn current(&self) -> Arc<DatasetSnapshot> {
        Arc::clone(&self.current)
    }

    /// Whether there are uncommitted edits.
    pub fn has_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// The pending record list, including uncommitted edits.
    pub fn staged_view(&self) -> &[Record] {
        match &self.staged {
            Some(staged) => staged,
            None => &self.current.records,
        }
    }

    /// Stage an edit against the local working copy.
    ///
    /// Index-addressed edits are checked against the staged view.
    pub fn stage(&mut self, edit: StagedEdit) -> Result<(), DatasetVersionError> {
        let current = &self.current;
        let staged = self
            .staged
            .get_or_insert_with(|| current.records.clone());

        match edit {
            StagedEdit::Append(record) => staged.push(record),
            StagedEdit::Update { index, patch } => {
                let len = staged.len();
                let record = staged
                    .get_mut(index)
                    .ok_or(DatasetVersionError::IndexOutOfRange { index, len })?;
                patch.apply(record);
            }
            StagedEdit::Delete { index } => {
                let len = staged.len();
                if index >= len {
                    return Err(DatasetVersionError::IndexOutOfRange { index, len });
                }
                staged.remove(index);
            }
        }

        Ok(())
    }

    /// Drop all uncommitted edits.
    pub fn discard(&mut self) {
        self.staged = None;
    }

    /// Publish staged edits and return the resulting version.
    ///
    /// Staged records that differ structurally from the current snapshot
    /// produce a new snapshot at `version + 1`; the superseded snapshot
    /// moves into history. Otherwise the edits only touched metadata and
    /// are applied to the current version in place.
    pub fn commit(&mut self) -> Result<u64, DatasetVersionError> {
        let Some(staged) = self.staged.take() else {
            return Ok(self.current.version);
        };
        let now = Utc::now();

        if !differs_structurally(&self.current.records, &staged) {
            tracing::debug!(
                dataset = %self.current.name,
                version = self.current.version,
                "Applying metadata-only edits in place"
            );
            self.current = Arc::new(DatasetSnapshot {
                records: staged,
                ..(*self.current).clone()
            });
            return Ok(self.current.version);
        }

        let next = DatasetSnapshot {
            name: self.current.name.clone(),
            version: self.current.version + 1,
            records: staged,
            created_at: now,
        };
        let previous = std::mem::replace(&mut self.current, Arc::new(next));
        let last_used_at = self.current_last_used.take().unwrap_or(now);
        self.history.insert(
            previous.version,
            RetainedSnapshot {
                snapshot: Arc::unwrap_or_clone(previous),
                last_used_at,
            },
        );

        tracing::info!(
            dataset = %self.current.name,
            version = self.current.version,
            records = self.current.records.len(),
            "Committed dataset version"
        );
        Ok(self.current.version)
    }

    /// Commit only if the current version is still `expected`.
    pub fn commit_expected(&mut self, expected: u64) -> Result<u64, DatasetVersionError> {
        if self.current.version != expected {
            return Err(DatasetVersionError::Conflict {
                name: self.current.name.clone(),
                expected,
                actual: self.current.version,
            });
        }
        self.commit()
    }

    /// Read-only snapshot at `version`, as of now.
    pub fn at(&self, version: u64) -> Result<Arc<DatasetSnapshot>, DatasetVersionError> {
        self.at_as_of(version, Utc::now())
    }

    /// Read-only snapshot at `version`, evaluating retention at `now`.
    ///
    /// Retrieval does not reset the retention window.
    pub fn at_as_of(
        &self,
        version: u64,
        now: DateTime<Utc>,
    ) -> Result<Arc<DatasetSnapshot>, DatasetVersionError> {
        if version == self.current.version {
            return Ok(self.current());
        }
        match self.history.get(&version) {
            Some(retained) if !is_expired(retained, now) => {
                Ok(Arc::new(retained.snapshot.clone()))
            }
            _ => Err(self.not_found(version)),
        }
    }

    /// Record that `version` is the input of a run starting at `now`.
    pub fn mark_used(
        &mut self,
        version: u64,
        now: DateTime<Utc>,
    ) -> Result<Arc<DatasetSnapshot>, DatasetVersionError> {
        if version == self.current.version {
            self.current_last_used = Some(now);
            return Ok(self.current());
        }
        let not_found = self.not_found(version);
        match self.history.get_mut(&version) {
            Some(retained) if !is_expired(retained, now) => {
                retained.last_used_at = now;
                Ok(Arc::new(retained.snapshot.clone()))
            }
            _ => Err(not_found),
        }
    }

    /// Drop expired history, returning the versions removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<u64> {
        let expired: Vec<u64> = self
            .history
            .iter()
            .filter(|(_, retained)| is_expired(retained, now))
            .map(|(version, _)| *version)
            .collect();
        for version in &expired {
            self.history.remove(version);
        }
        if !expired.is_empty() {
            tracing::info!(dataset = %self.current.name, versions = ?expired, "Purged expired snapshots");
        }
        expired
    }

    /// Versions currently retrievable at `now`, oldest first.
    pub fn retained_versions(&self, now: DateTime<Utc>) -> Vec<u64> {
        let mut versions: Vec<u64> = self
            .history
            .iter()
            .filter(|(_, retained)| !is_expired(retained, now))
            .map(|(version, _)| *version)
            .collect();
        versions.push(self.current.version);
        versions
    }

    fn not_found(&self, version: u64) -> DatasetVersionError {
        DatasetVersionError::NotFound {
            name: self.current.name.clone(),
            version,
        }
    }
}

/// Whether `staged` adds, removes, reorders or changes the input or
/// expected output of any record relative to `current`.
fn differs_structurally(current: &[Record], staged: &[Record]) -> bool {
    current.len() != staged.len()
        || current.iter().zip(staged).any(|(a, b)| {
            a.id != b.id || a.input_data != b.input_data || a.expected_output != b.expected_output
        })
}

fn is_expired(retained: &RetainedSnapshot, now: DateTime<Utc>) -> bool {
    now - retained.last_used_at > Duration::days(RETENTION_DAYS)
}
