//! Recovery point selection and event-log replay.
//!
//! On restart, coordinated mode selects the highest complete manifest epoch
//! and resumes every worker from that epoch's recorded offsets, one common
//! logical point. Uncoordinated mode selects each worker's latest local
//! snapshot independently; workers may resume at different logical times and
//! global state is only eventually consistent until replay catches up.
//! Absence of any valid recovery point is fatal at startup.

use crate::event_log::{EventLog, EventLogError, LogEvent};
use crate::manifest::{ManifestError, SnapshotManifest};
use crate::record::{
    checksum, uncoordinated_prefix, Epoch, SnapshotEnvelope, SnapshotRecord, WorkerId,
};
use crate::store::{SnapshotStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Error type for recovery operations.
#[derive(Error, Debug)]
pub enum RecoveryError {
    /// No valid manifest entry or snapshot history exists; requires fresh
    /// initialization or manual intervention.
    #[error("no valid recovery point available")]
    NoRecoveryPoint,
    /// A fetched snapshot does not match its recorded checksum.
    #[error("snapshot checksum mismatch for {key}")]
    ChecksumMismatch {
        /// Storage key of the corrupt object.
        key: String,
    },
    /// A stored object could not be parsed as a snapshot envelope.
    #[error("corrupt snapshot object {key}: {reason}")]
    Corrupt {
        /// Storage key of the corrupt object.
        key: String,
        /// Parse or decode failure.
        reason: String,
    },
    /// Underlying store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// Manifest could not be loaded.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    /// Event log failure during replay.
    #[error("event log error: {0}")]
    EventLog(#[from] EventLogError),
}

/// The selected recovery point.
#[derive(Clone, Debug)]
pub enum RecoveryPoint {
    /// All workers resume from the same coordinated epoch.
    Coordinated {
        /// The highest complete epoch.
        epoch: Epoch,
        /// Per-worker records for that epoch.
        records: Vec<SnapshotRecord>,
    },
    /// Each worker resumes from its own latest local snapshot.
    Uncoordinated {
        /// Latest record per worker that has snapshot history.
        records: Vec<SnapshotRecord>,
        /// Workers with no history; they start fresh from offset zero.
        fresh: Vec<WorkerId>,
    },
}

/// Replay instruction for one worker: restore the image, then apply `events`
/// starting at `replay_from`.
#[derive(Clone, Debug)]
pub struct WorkerRecovery {
    /// The worker being recovered.
    pub worker_id: WorkerId,
    /// Serialized state image to restore, or `None` for a fresh start.
    pub state: Option<Vec<u8>>,
    /// First event-log offset to replay.
    pub replay_from: u64,
    /// Events to apply, in offset order.
    pub events: Vec<LogEvent>,
}

/// Selects recovery points and drives per-worker replay.
pub struct RecoveryManager {
    store: Arc<dyn SnapshotStore>,
    log: Arc<dyn EventLog>,
}

impl RecoveryManager {
    /// Creates a manager over the given store and event log.
    pub fn new(store: Arc<dyn SnapshotStore>, log: Arc<dyn EventLog>) -> Self {
        Self { store, log }
    }

    /// Selects the coordinated recovery point: the highest complete epoch.
    pub fn select_coordinated(
        &self,
        manifest: &SnapshotManifest,
    ) -> Result<RecoveryPoint, RecoveryError> {
        let entry = manifest.latest_complete().ok_or(RecoveryError::NoRecoveryPoint)?;
        info!(
            epoch = entry.epoch.as_u64(),
            workers = entry.records.len(),
            "selected coordinated recovery point"
        );
        Ok(RecoveryPoint::Coordinated {
            epoch: entry.epoch,
            records: entry.records.clone(),
        })
    }

    /// Selects the uncoordinated recovery point: each worker's latest local
    /// snapshot. Workers with no history start fresh; if no worker has any
    /// history at all, recovery fails.
    pub async fn select_uncoordinated(
        &self,
        workers: &[WorkerId],
    ) -> Result<RecoveryPoint, RecoveryError> {
        let mut records = Vec::new();
        let mut fresh = Vec::new();
        for &worker in workers {
            let keys = self.store.list(&uncoordinated_prefix(worker)).await?;
            match keys.last() {
                Some(key) => {
                    let envelope = self.fetch_envelope(key).await?;
                    verify(&envelope, key)?;
                    records.push(envelope.record);
                }
                None => {
                    warn!(worker = %worker, "no snapshot history, worker starts fresh");
                    fresh.push(worker);
                }
            }
        }
        if records.is_empty() {
            return Err(RecoveryError::NoRecoveryPoint);
        }
        Ok(RecoveryPoint::Uncoordinated { records, fresh })
    }

    /// Fetches and verifies one worker's snapshot, returning its replay
    /// instruction.
    pub async fn recover_worker(
        &self,
        record: &SnapshotRecord,
    ) -> Result<WorkerRecovery, RecoveryError> {
        let envelope = self.fetch_envelope(&record.storage_key).await?;
        let state = verify(&envelope, &record.storage_key)?;
        if envelope.record.checksum != record.checksum {
            return Err(RecoveryError::ChecksumMismatch {
                key: record.storage_key.clone(),
            });
        }
        let events = self.log.replay(record.worker_id, record.log_offset).await?;
        info!(
            worker = %record.worker_id,
            replay_from = record.log_offset,
            events = events.len(),
            "worker recovery prepared"
        );
        Ok(WorkerRecovery {
            worker_id: record.worker_id,
            state: Some(state),
            replay_from: record.log_offset,
            events,
        })
    }

    /// Builds replay instructions for every worker in the recovery point.
    pub async fn recover_all(
        &self,
        point: &RecoveryPoint,
    ) -> Result<Vec<WorkerRecovery>, RecoveryError> {
        let mut recoveries = Vec::new();
        match point {
            RecoveryPoint::Coordinated { records, .. } => {
                for record in records {
                    recoveries.push(self.recover_worker(record).await?);
                }
            }
            RecoveryPoint::Uncoordinated { records, fresh } => {
                for record in records {
                    recoveries.push(self.recover_worker(record).await?);
                }
                for &worker in fresh {
                    let events = match self.log.replay(worker, 0).await {
                        Ok(events) => events,
                        Err(EventLogError::UnknownPartition(_)) => Vec::new(),
                        Err(e) => return Err(e.into()),
                    };
                    recoveries.push(WorkerRecovery {
                        worker_id: worker,
                        state: None,
                        replay_from: 0,
                        events,
                    });
                }
            }
        }
        Ok(recoveries)
    }

    async fn fetch_envelope(&self, key: &str) -> Result<SnapshotEnvelope, RecoveryError> {
        let bytes = self.store.get(key).await?;
        serde_json::from_slice(&bytes).map_err(|e| RecoveryError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Decodes the envelope's state and checks it against the embedded checksum.
fn verify(envelope: &SnapshotEnvelope, key: &str) -> Result<Vec<u8>, RecoveryError> {
    let state = envelope.state().map_err(|e| RecoveryError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    if checksum(&state) != envelope.record.checksum {
        return Err(RecoveryError::ChecksumMismatch {
            key: key.to_string(),
        });
    }
    Ok(state)
}
