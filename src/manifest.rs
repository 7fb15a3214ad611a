//! Snapshot manifest: the coordinator's durable record of resolved epochs.
//!
//! Each coordinated epoch that reaches a terminal state (complete or
//! abandoned) produces one immutable [`ManifestEntry`], persisted through the
//! snapshot store under the `manifest/` prefix, one object per epoch, so the
//! store's no-overwrite contract holds. The in-memory [`SnapshotManifest`] is
//! owned exclusively by the coordinator task; recovery loads it read-only at
//! startup.

use crate::record::{Epoch, SnapshotRecord, WorkerId};
use crate::store::{SnapshotStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Error type for manifest operations.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// Underlying store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// Entry could not be serialized or parsed.
    #[error("manifest serialization error: {0}")]
    Serialization(String),
    /// An entry for this epoch was already recorded.
    #[error("duplicate manifest entry for epoch {0}")]
    DuplicateEpoch(Epoch),
}

/// Terminal state of a coordinated epoch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EpochStatus {
    /// Every worker required at completion time acknowledged a record.
    Complete,
    /// The epoch was abandoned with no usable records.
    Incomplete,
}

/// Immutable record of one resolved epoch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// The epoch this entry resolves.
    pub epoch: Epoch,
    /// Whether the epoch forms a valid recovery point.
    pub status: EpochStatus,
    /// Acknowledged per-worker records; empty for incomplete epochs.
    pub records: Vec<SnapshotRecord>,
    /// When the epoch reached its terminal state.
    pub resolved_at: DateTime<Utc>,
}

impl ManifestEntry {
    /// Returns the record for one worker, if it acknowledged this epoch.
    pub fn record_for(&self, worker: WorkerId) -> Option<&SnapshotRecord> {
        self.records.iter().find(|r| r.worker_id == worker)
    }

    /// Returns true if this entry is a valid recovery point.
    pub fn is_complete(&self) -> bool {
        self.status == EpochStatus::Complete
    }
}

/// Storage key for one epoch's manifest entry.
pub fn entry_key(epoch: Epoch) -> String {
    format!("manifest/{:010}.json", epoch.as_u64())
}

/// Key prefix covering all manifest entries.
pub const MANIFEST_PREFIX: &str = "manifest/";

/// Mapping of resolved epochs to their per-worker snapshot records.
#[derive(Debug, Default)]
pub struct SnapshotManifest {
    entries: BTreeMap<Epoch, ManifestEntry>,
}

impl SnapshotManifest {
    /// Creates an empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a resolved epoch. Each epoch resolves exactly once.
    pub fn record_entry(&mut self, entry: ManifestEntry) -> Result<(), ManifestError> {
        if self.entries.contains_key(&entry.epoch) {
            return Err(ManifestError::DuplicateEpoch(entry.epoch));
        }
        self.entries.insert(entry.epoch, entry);
        Ok(())
    }

    /// Returns the entry for an epoch.
    pub fn entry(&self, epoch: Epoch) -> Option<&ManifestEntry> {
        self.entries.get(&epoch)
    }

    /// Returns the highest complete epoch's entry, the preferred recovery
    /// point.
    pub fn latest_complete(&self) -> Option<&ManifestEntry> {
        self.entries
            .values()
            .rev()
            .find(|e| e.status == EpochStatus::Complete)
    }

    /// Returns all complete epochs in ascending order.
    pub fn complete_epochs(&self) -> Vec<Epoch> {
        self.entries
            .values()
            .filter(|e| e.status == EpochStatus::Complete)
            .map(|e| e.epoch)
            .collect()
    }

    /// Returns all incomplete epochs in ascending order.
    pub fn incomplete_epochs(&self) -> Vec<Epoch> {
        self.entries
            .values()
            .filter(|e| e.status == EpochStatus::Incomplete)
            .map(|e| e.epoch)
            .collect()
    }

    /// Removes an epoch's entry after its generations are compacted away.
    pub fn prune(&mut self, epoch: Epoch) -> Option<ManifestEntry> {
        self.entries.remove(&epoch)
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no epoch has resolved yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persists one entry through the store under [`entry_key`].
    pub async fn persist_entry(
        store: &dyn SnapshotStore,
        entry: &ManifestEntry,
    ) -> Result<(), ManifestError> {
        let json = serde_json::to_vec(entry)
            .map_err(|e| ManifestError::Serialization(e.to_string()))?;
        store.put(&entry_key(entry.epoch), &json).await?;
        Ok(())
    }

    /// Loads all persisted entries from the store.
    pub async fn load(store: &dyn SnapshotStore) -> Result<Self, ManifestError> {
        let mut manifest = Self::new();
        for key in store.list(MANIFEST_PREFIX).await? {
            let bytes = store.get(&key).await?;
            let entry: ManifestEntry = serde_json::from_slice(&bytes)
                .map_err(|e| ManifestError::Serialization(e.to_string()))?;
            manifest.record_entry(entry)?;
        }
        Ok(manifest)
    }
}
