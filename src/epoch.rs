//! Coordinated epoch state machine.
//!
//! One barrier round at a time: Idle → SnapshotRequested → CollectingAcks →
//! Complete, looping on the configured period. The required-ack set is the
//! workers alive at request time and shrinks as workers are marked dead; the
//! epoch completes exactly once, when the acknowledged set covers the
//! required set. A round whose required workers all die before any record is
//! acknowledged resolves incomplete and is abandoned, never retried under the
//! same epoch.

use crate::manifest::{EpochStatus, ManifestEntry};
use crate::record::{Epoch, SnapshotRecord, WorkerId};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

/// Error type for epoch manager operations.
#[derive(Error, Debug)]
pub enum EpochError {
    /// A round is already in flight; only one epoch runs at a time.
    #[error("epoch {0} is still in flight")]
    EpochInFlight(Epoch),
    /// No workers are alive to participate in a round.
    #[error("no alive workers to snapshot")]
    NoAliveWorkers,
}

/// Phase of the coordinated snapshot protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EpochPhase {
    /// No round in flight.
    Idle,
    /// A round was assigned and the barrier is being broadcast.
    SnapshotRequested,
    /// Waiting for the required-ack set to be satisfied.
    CollectingAcks,
    /// The previous round completed; the next may begin.
    Complete,
}

/// Barrier broadcast to every worker alive at request time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BarrierRequest {
    /// The newly assigned epoch.
    pub epoch: Epoch,
    /// Required-ack set at request time.
    pub workers: Vec<WorkerId>,
}

/// Terminal resolution of a round.
#[derive(Debug)]
pub enum EpochOutcome {
    /// The required set was covered; the entry is a valid recovery point.
    Completed(ManifestEntry),
    /// All required workers died with no acknowledged record.
    Abandoned(ManifestEntry),
}

struct InFlight {
    epoch: Epoch,
    required: HashSet<WorkerId>,
    acked: HashMap<WorkerId, SnapshotRecord>,
    started_at: DateTime<Utc>,
}

/// Assigns epochs, tracks barrier acknowledgments, and resolves rounds.
pub struct EpochManager {
    next_epoch: u64,
    phase: EpochPhase,
    current: Option<InFlight>,
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochManager {
    /// Creates a manager with no rounds assigned yet; the first epoch is 1.
    pub fn new() -> Self {
        Self {
            next_epoch: 1,
            phase: EpochPhase::Idle,
            current: None,
        }
    }

    /// Creates a manager that resumes numbering after `last`, for restarts
    /// from a loaded manifest.
    pub fn resuming_after(last: Epoch) -> Self {
        Self {
            next_epoch: last.as_u64() + 1,
            phase: EpochPhase::Idle,
            current: None,
        }
    }

    /// Returns the current protocol phase.
    pub fn phase(&self) -> EpochPhase {
        self.phase
    }

    /// Returns the in-flight epoch, if any.
    pub fn current_epoch(&self) -> Option<Epoch> {
        self.current.as_ref().map(|c| c.epoch)
    }

    /// Returns true while a round is between request and resolution.
    pub fn in_flight(&self) -> bool {
        self.current.is_some()
    }

    /// Assigns the next epoch and opens a round over the given alive set.
    ///
    /// Epoch numbers strictly increase and are assigned exactly once, even
    /// for rounds that are later abandoned.
    pub fn begin_epoch_at(
        &mut self,
        alive: &[WorkerId],
        now: DateTime<Utc>,
    ) -> Result<BarrierRequest, EpochError> {
        if let Some(current) = &self.current {
            return Err(EpochError::EpochInFlight(current.epoch));
        }
        if alive.is_empty() {
            return Err(EpochError::NoAliveWorkers);
        }
        let epoch = Epoch::new(self.next_epoch);
        self.next_epoch += 1;
        self.current = Some(InFlight {
            epoch,
            required: alive.iter().copied().collect(),
            acked: HashMap::new(),
            started_at: now,
        });
        self.phase = EpochPhase::SnapshotRequested;
        Ok(BarrierRequest {
            epoch,
            workers: alive.to_vec(),
        })
    }

    /// Wall-clock wrapper for [`begin_epoch_at`](Self::begin_epoch_at).
    pub fn begin_epoch(&mut self, alive: &[WorkerId]) -> Result<BarrierRequest, EpochError> {
        self.begin_epoch_at(alive, Utc::now())
    }

    /// Marks the barrier as broadcast; the round now collects acks.
    pub fn barrier_sent(&mut self) {
        if self.current.is_some() {
            self.phase = EpochPhase::CollectingAcks;
        }
    }

    /// Records a worker's acknowledgment for `epoch`.
    ///
    /// Acks for a round that is no longer in flight are ignored (the record
    /// itself is already durable). Returns the round's resolution if this ack
    /// completed it.
    pub fn record_ack_at(
        &mut self,
        epoch: Epoch,
        record: SnapshotRecord,
        now: DateTime<Utc>,
    ) -> Option<EpochOutcome> {
        let current = self.current.as_mut()?;
        if current.epoch != epoch {
            tracing::warn!(
                epoch = epoch.as_u64(),
                in_flight = current.epoch.as_u64(),
                worker = %record.worker_id,
                "ignoring stale snapshot ack"
            );
            return None;
        }
        current.acked.insert(record.worker_id, record);
        self.try_resolve(now)
    }

    /// Wall-clock wrapper for [`record_ack_at`](Self::record_ack_at).
    pub fn record_ack(&mut self, epoch: Epoch, record: SnapshotRecord) -> Option<EpochOutcome> {
        self.record_ack_at(epoch, record, Utc::now())
    }

    /// Removes a dead worker from the required set.
    ///
    /// Returns the round's resolution if the shrink completed or abandoned
    /// it.
    pub fn worker_dead_at(&mut self, worker: WorkerId, now: DateTime<Utc>) -> Option<EpochOutcome> {
        let current = self.current.as_mut()?;
        current.required.remove(&worker);
        self.try_resolve(now)
    }

    /// Wall-clock wrapper for [`worker_dead_at`](Self::worker_dead_at).
    pub fn worker_dead(&mut self, worker: WorkerId) -> Option<EpochOutcome> {
        self.worker_dead_at(worker, Utc::now())
    }

    /// Returns how long the in-flight round has been collecting acks.
    pub fn stalled_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        let current = self.current.as_ref()?;
        now.signed_duration_since(current.started_at).to_std().ok()
    }

    fn try_resolve(&mut self, now: DateTime<Utc>) -> Option<EpochOutcome> {
        let (completed, abandoned) = {
            let current = self.current.as_ref()?;
            let covered = current.required.iter().all(|w| current.acked.contains_key(w));
            (
                covered && !current.acked.is_empty(),
                current.required.is_empty() && current.acked.is_empty(),
            )
        };
        if completed {
            let current = self.current.take()?;
            self.phase = EpochPhase::Complete;
            let mut records: Vec<SnapshotRecord> = current.acked.into_values().collect();
            records.sort_by_key(|r| r.worker_id);
            return Some(EpochOutcome::Completed(ManifestEntry {
                epoch: current.epoch,
                status: EpochStatus::Complete,
                records,
                resolved_at: now,
            }));
        }
        if abandoned {
            let current = self.current.take()?;
            self.phase = EpochPhase::Idle;
            tracing::warn!(
                epoch = current.epoch.as_u64(),
                "abandoning epoch: all required workers died before acknowledging"
            );
            return Some(EpochOutcome::Abandoned(ManifestEntry {
                epoch: current.epoch,
                status: EpochStatus::Incomplete,
                records: Vec::new(),
                resolved_at: now,
            }));
        }
        None
    }
}
