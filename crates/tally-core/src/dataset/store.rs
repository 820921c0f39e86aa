//! Name-unique registry of versioned datasets.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::versioned::RetainedSnapshot;
use super::{DatasetSnapshot, DatasetVersionError, Record, VersionedDataset};

/// Errors from loading or saving a store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access dataset store: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode dataset store: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Version(#[from] DatasetVersionError),
}

/// Datasets keyed by globally unique name.
///
/// Each dataset sits behind its own lock, which is the single-writer guard
/// on its current-version pointer. Runs never hold the lock; they receive an
/// `Arc<DatasetSnapshot>`.
#[derive(Default)]
pub struct DatasetStore {
    datasets: RwLock<BTreeMap<String, Arc<RwLock<VersionedDataset>>>>,
}

impl DatasetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new dataset at version 0.
    pub fn create(
        &self,
        name: impl Into<String>,
        records: Vec<Record>,
    ) -> Result<Arc<DatasetSnapshot>, DatasetVersionError> {
        let dataset = VersionedDataset::create(name, records)?;
        let snapshot = dataset.current();
        self.insert(dataset)?;
        Ok(snapshot)
    }

    /// Register an existing dataset under its own name.
    pub fn insert(&self, dataset: VersionedDataset) -> Result<(), DatasetVersionError> {
        let mut datasets = self.datasets.write();
        let name = dataset.name().to_string();
        if datasets.contains_key(&name) {
            return Err(DatasetVersionError::DuplicateName(name));
        }
        datasets.insert(name, Arc::new(RwLock::new(dataset)));
        Ok(())
    }

    /// Writer handle for staging and committing edits.
    pub fn dataset(&self, name: &str) -> Result<Arc<RwLock<VersionedDataset>>, DatasetVersionError> {
        self.datasets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DatasetVersionError::UnknownDataset(name.to_string()))
    }

    pub fn current(&self, name: &str) -> Result<Arc<DatasetSnapshot>, DatasetVersionError> {
        Ok(self.dataset(name)?.read().current())
    }

    /// Pin the snapshot a run will use and mark it as a run input.
    ///
    /// `None` pins the current version.
    pub fn resolve(
        &self,
        name: &str,
        version: Option<u64>,
    ) -> Result<Arc<DatasetSnapshot>, DatasetVersionError> {
        self.resolve_as_of(name, version, Utc::now())
    }

    pub fn resolve_as_of(
        &self,
        name: &str,
        version: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<Arc<DatasetSnapshot>, DatasetVersionError> {
        let handle = self.dataset(name)?;
        let mut dataset = handle.write();
        let version = version.unwrap_or_else(|| dataset.version());
        dataset.mark_used(version, now)
    }

    pub fn names(&self) -> Vec<String> {
        self.datasets.read().keys().cloned().collect()
    }

    /// Purge expired history across all datasets.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> BTreeMap<String, Vec<u64>> {
        self.datasets
            .read()
            .iter()
            .map(|(name, dataset)| (name.clone(), dataset.write().purge_expired(now)))
            .filter(|(_, purged)| !purged.is_empty())
            .collect()
    }

    /// Persist committed state as JSON. Staged edits are not saved.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let persisted: Vec<PersistedDataset> = self
            .datasets
            .read()
            .values()
            .map(|dataset| PersistedDataset::from_dataset(&dataset.read()))
            .collect();
        let json = serde_json::to_string_pretty(&persisted)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let contents = fs::read_to_string(path)?;
        let persisted: Vec<PersistedDataset> = serde_json::from_str(&contents)?;
        let store = Self::new();
        for dataset in persisted {
            store.insert(dataset.into_dataset())?;
        }
        Ok(store)
    }

    /// Load `path` if it exists, otherwise start empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedDataset {
    current: DatasetSnapshot,
    #[serde(default)]
    current_last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    history: Vec<RetainedSnapshot>,
}

impl PersistedDataset {
    fn from_dataset(dataset: &VersionedDataset) -> Self {
        let (current, current_last_used, history) = dataset.parts();
        Self {
            current: current.clone(),
            current_last_used,
            history: history.values().cloned().collect(),
        }
    }

    fn into_dataset(self) -> VersionedDataset {
        let history = self
            .history
            .into_iter()
            .map(|retained| (retained.snapshot.version, retained))
            .collect();
        VersionedDataset::from_parts(self.current, self.current_last_used, history)
    }
}
