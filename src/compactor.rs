//! Compaction of superseded snapshot generations.
//!
//! Runs on its own interval and never blocks new snapshot writes. In
//! coordinated mode, generations strictly older than the two most recent
//! complete epochs are deleted; the most recent complete generation besides
//! the newest is retained as a safety margin against a crash during
//! compaction. In uncoordinated mode, compaction is per worker: every
//! generation older than that worker's newest is eligible, independent of
//! other workers. Deletion failures are logged and retried next interval.

use crate::manifest::{entry_key, SnapshotManifest};
use crate::record::{seq_from_key, uncoordinated_prefix, Epoch, LocalSeq, WorkerId};
use crate::store::SnapshotStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Oldest retained generation, globally (coordinated) or per worker
/// (uncoordinated). The horizon never exceeds the latest fully-durable
/// generation.
#[derive(Clone, Debug, Default)]
pub struct CompactionHorizon {
    coordinated: Option<Epoch>,
    per_worker: HashMap<WorkerId, LocalSeq>,
}

impl CompactionHorizon {
    /// Oldest retained coordinated epoch, if compaction has run.
    pub fn coordinated(&self) -> Option<Epoch> {
        self.coordinated
    }

    /// Oldest retained local sequence for a worker, if compaction has run.
    pub fn for_worker(&self, worker: WorkerId) -> Option<LocalSeq> {
        self.per_worker.get(&worker).copied()
    }
}

/// Result of one compaction pass.
#[derive(Debug, Default)]
pub struct CompactionReport {
    /// Keys deleted this pass.
    pub deleted_keys: Vec<String>,
    /// Keys whose deletion failed; retried next interval.
    pub failed_keys: Vec<String>,
    /// Epochs whose generations and manifest entries are fully gone.
    pub pruned_epochs: Vec<Epoch>,
}

impl CompactionReport {
    /// Returns true if the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.deleted_keys.is_empty() && self.failed_keys.is_empty()
    }
}

/// Prunes superseded snapshot generations from the store.
pub struct Compactor {
    store: Arc<dyn SnapshotStore>,
    horizon: CompactionHorizon,
}

impl Compactor {
    /// Creates a compactor over the given store.
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            horizon: CompactionHorizon::default(),
        }
    }

    /// Returns the current horizon.
    pub fn horizon(&self) -> &CompactionHorizon {
        &self.horizon
    }

    /// Coordinated pass: deletes generations of complete epochs strictly
    /// older than the safety margin, pruning fully-deleted epochs from the
    /// manifest. Re-running over an already-compacted set deletes nothing.
    ///
    /// Runs inside the coordinator's owner task, which keeps manifest writes
    /// single-owner.
    pub async fn compact_coordinated(
        &mut self,
        manifest: &mut SnapshotManifest,
    ) -> CompactionReport {
        let mut report = CompactionReport::default();
        let complete = manifest.complete_epochs();
        if complete.len() < 2 {
            debug!("compaction: fewer than two complete epochs, nothing eligible");
            return report;
        }
        // Retain the newest complete epoch and one older complete epoch as
        // the safety margin; everything before those is superseded.
        let eligible: Vec<Epoch> = complete[..complete.len() - 2].to_vec();
        let margin = complete[complete.len() - 2];

        for epoch in eligible {
            let keys: Vec<String> = match manifest.entry(epoch) {
                Some(entry) => entry.records.iter().map(|r| r.storage_key.clone()).collect(),
                None => continue,
            };
            let mut failed = false;
            for key in keys {
                match self.store.delete(&key).await {
                    Ok(()) => report.deleted_keys.push(key),
                    Err(e) => {
                        warn!(key = %key, error = %e, "compaction delete failed, will retry next interval");
                        report.failed_keys.push(key);
                        failed = true;
                    }
                }
            }
            if failed {
                continue;
            }
            match self.store.delete(&entry_key(epoch)).await {
                Ok(()) => {
                    manifest.prune(epoch);
                    report.pruned_epochs.push(epoch);
                }
                Err(e) => {
                    warn!(epoch = epoch.as_u64(), error = %e, "manifest entry delete failed, will retry next interval");
                    report.failed_keys.push(entry_key(epoch));
                }
            }
        }

        // Abandoned epochs carry no generations; drop their entries once a
        // newer complete epoch supersedes them.
        let latest = complete[complete.len() - 1];
        for epoch in manifest.incomplete_epochs() {
            if epoch >= latest {
                continue;
            }
            match self.store.delete(&entry_key(epoch)).await {
                Ok(()) => {
                    manifest.prune(epoch);
                    report.pruned_epochs.push(epoch);
                }
                Err(e) => {
                    warn!(epoch = epoch.as_u64(), error = %e, "manifest entry delete failed, will retry next interval");
                    report.failed_keys.push(entry_key(epoch));
                }
            }
        }

        self.horizon.coordinated = Some(margin);
        if !report.is_noop() {
            info!(
                deleted = report.deleted_keys.len(),
                failed = report.failed_keys.len(),
                horizon = margin.as_u64(),
                "coordinated compaction pass finished"
            );
        }
        report
    }

    /// Uncoordinated pass: for each worker, deletes every generation older
    /// than that worker's newest. Workers compact independently; one
    /// worker's failures never affect another's pass.
    pub async fn compact_uncoordinated(&mut self, workers: &[WorkerId]) -> CompactionReport {
        let mut report = CompactionReport::default();
        for &worker in workers {
            let keys = match self.store.list(&uncoordinated_prefix(worker)).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(worker = %worker, error = %e, "compaction list failed, will retry next interval");
                    continue;
                }
            };
            if keys.len() <= 1 {
                continue;
            }
            // Keys list in creation order; the last is the newest generation.
            let (older, newest) = keys.split_at(keys.len() - 1);
            for key in older {
                match self.store.delete(key).await {
                    Ok(()) => report.deleted_keys.push(key.clone()),
                    Err(e) => {
                        warn!(key = %key, error = %e, "compaction delete failed, will retry next interval");
                        report.failed_keys.push(key.clone());
                    }
                }
            }
            if let Some(seq) = seq_from_key(&newest[0]) {
                self.horizon.per_worker.insert(worker, seq);
            }
        }
        if !report.is_noop() {
            info!(
                deleted = report.deleted_keys.len(),
                failed = report.failed_keys.len(),
                "uncoordinated compaction pass finished"
            );
        }
        report
    }
}
