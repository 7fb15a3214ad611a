//! Worker-side snapshot engine.
//!
//! Takes a snapshot on a trigger: a coordinated barrier epoch or the
//! worker's local timer. Capture is a brief freeze that returns an owned
//! image of the partition state plus the current event-log offset; the
//! serialization and durable write then run without holding up processing.
//! Storage-write failures are retried with bounded backoff; serialization
//! failure is fatal to the worker and escalates to restart.

use crate::record::{
    checksum, Epoch, LocalSeq, SnapshotEnvelope, SnapshotPoint, SnapshotRecord, WorkerId,
};
use crate::store::SnapshotStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Error type for snapshot attempts.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The worker could not capture or serialize its own state. Fatal to the
    /// worker; escalates to restart.
    #[error("state serialization failed: {0}")]
    Serialization(String),
    /// Every write attempt failed; the attempt is abandoned and the worker
    /// continues on its previous good baseline.
    #[error("storage write retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Attempts made before giving up.
        attempts: u32,
        /// The final storage error.
        last_error: String,
    },
}

impl SnapshotError {
    /// Returns true for failures that require restarting the worker.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SnapshotError::Serialization(_))
    }
}

/// What initiated a snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SnapshotTrigger {
    /// A coordinated barrier request for the given epoch.
    Epoch(Epoch),
    /// The worker's own timer (uncoordinated strategy).
    LocalTimer,
}

/// A point-in-time image of a worker's owned state.
#[derive(Clone, Debug)]
pub struct CapturedState<S> {
    /// The frozen state image.
    pub state: S,
    /// First event-log offset not yet reflected in the image.
    pub log_offset: u64,
}

/// Source of a worker's partition state.
///
/// `capture` must be cheap: it runs during the brief freeze; processing
/// resumes against the live state as soon as it returns.
pub trait SnapshotSource: Send + Sync {
    /// Serializable image type produced by a capture.
    type State: Serialize + Send + 'static;

    /// Freezes and returns an owned image of the current state along with
    /// the event-log offset it reflects.
    fn capture(&self) -> Result<CapturedState<Self::State>, SnapshotError>;
}

/// Bounded exponential backoff for storage writes.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts before giving up (including the first).
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Sets the attempt limit.
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Sets the initial backoff.
    pub fn with_initial_backoff(mut self, d: Duration) -> Self {
        self.initial_backoff = d;
        self
    }

    /// Returns the delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doubled = self
            .initial_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        doubled.min(self.max_backoff)
    }
}

/// Serializes and durably writes one worker's snapshots.
pub struct WorkerSnapshotEngine<S: SnapshotSource> {
    worker_id: WorkerId,
    source: S,
    store: Arc<dyn SnapshotStore>,
    retry: RetryPolicy,
    snapshot_interval: Duration,
    next_seq: u64,
    last_snapshot_at: Option<DateTime<Utc>>,
}

impl<S: SnapshotSource> WorkerSnapshotEngine<S> {
    /// Creates an engine for one worker over the given store.
    pub fn new(worker_id: WorkerId, source: S, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            worker_id,
            source,
            store,
            retry: RetryPolicy::default(),
            snapshot_interval: Duration::from_secs(10),
            next_seq: 0,
            last_snapshot_at: None,
        }
    }

    /// Sets the write retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the local-timer snapshot interval.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Resumes local numbering after a recovered snapshot, so sequence
    /// numbers stay monotonic across restarts.
    pub fn resuming_after(mut self, last: LocalSeq) -> Self {
        self.next_seq = last.as_u64() + 1;
        self
    }

    /// Returns this engine's worker id.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Returns the sequence the next local snapshot will use.
    pub fn next_seq(&self) -> LocalSeq {
        LocalSeq::new(self.next_seq)
    }

    /// Returns true when the local timer is due at `now`.
    ///
    /// Snapshots are serialized through `&mut self`, so a new one cannot
    /// start while another is in progress.
    pub fn should_snapshot_at(&self, now: DateTime<Utc>) -> bool {
        match self.last_snapshot_at {
            None => true,
            Some(last) => {
                now.signed_duration_since(last).to_std().map_or(false, |d| {
                    d >= self.snapshot_interval
                })
            }
        }
    }

    /// Wall-clock wrapper for [`should_snapshot_at`](Self::should_snapshot_at).
    pub fn should_snapshot(&self) -> bool {
        self.should_snapshot_at(Utc::now())
    }

    /// Takes one snapshot: freeze, serialize, write, and return the record.
    ///
    /// The local sequence advances only on success, so an abandoned attempt
    /// never leaves a gap in a worker's history.
    pub async fn take_snapshot(
        &mut self,
        trigger: SnapshotTrigger,
    ) -> Result<SnapshotRecord, SnapshotError> {
        let started = Utc::now();
        let captured = self.source.capture()?;
        let state = serde_json::to_vec(&captured.state)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        let point = match trigger {
            SnapshotTrigger::Epoch(epoch) => SnapshotPoint::Epoch(epoch),
            SnapshotTrigger::LocalTimer => SnapshotPoint::Local(LocalSeq::new(self.next_seq)),
        };
        let storage_key = point.storage_key(self.worker_id);
        let record = SnapshotRecord {
            worker_id: self.worker_id,
            point,
            created_at: started,
            storage_key: storage_key.clone(),
            size_bytes: state.len() as u64,
            checksum: checksum(&state),
            log_offset: captured.log_offset,
        };
        let envelope = SnapshotEnvelope::new(record.clone(), &state);
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        self.write_with_retry(&storage_key, &bytes).await?;

        if trigger == SnapshotTrigger::LocalTimer {
            self.next_seq += 1;
        }
        self.last_snapshot_at = Some(Utc::now());
        let elapsed = Utc::now().signed_duration_since(started);
        info!(
            worker = %self.worker_id,
            key = %storage_key,
            size = record.size_bytes,
            elapsed_ms = elapsed.num_milliseconds(),
            "snapshot written"
        );
        Ok(record)
    }

    async fn write_with_retry(&self, key: &str, bytes: &[u8]) -> Result<(), SnapshotError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.put(key, bytes).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.retry.max_attempts => {
                    warn!(
                        worker = %self.worker_id,
                        key,
                        attempts = attempt,
                        error = %e,
                        "abandoning snapshot attempt: storage write retries exhausted"
                    );
                    return Err(SnapshotError::RetriesExhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        worker = %self.worker_id,
                        key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "snapshot write failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
