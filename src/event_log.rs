//! Append-only event log collaborator.
//!
//! The core consumes this interface for recovery replay: stable per-worker
//! offsets and replay-from-offset. Production deployments back it with the
//! broker named by [`CheckpointConfig`](crate::config::CheckpointConfig);
//! [`InMemoryEventLog`] backs tests and single-process use.

use crate::record::WorkerId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

/// Error type for event log operations.
#[derive(Error, Debug)]
pub enum EventLogError {
    /// No partition exists for the worker.
    #[error("unknown event log partition for worker {0}")]
    UnknownPartition(WorkerId),
    /// Broker rejected the request or is unreachable.
    #[error("event log unavailable: {0}")]
    Unavailable(String),
}

/// One replayable event with its stable offset.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Stable offset within the worker's partition, starting at 0.
    pub offset: u64,
    /// Opaque event payload.
    pub payload: Vec<u8>,
}

/// Append-only event log with stable per-worker offsets.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends to a worker's partition, returning the assigned offset.
    async fn append(&self, worker: WorkerId, payload: Vec<u8>) -> Result<u64, EventLogError>;

    /// Returns events with offset ≥ `from`, in offset order.
    async fn replay(&self, worker: WorkerId, from: u64) -> Result<Vec<LogEvent>, EventLogError>;

    /// Returns the next offset a worker's partition will assign (0 when
    /// empty).
    async fn next_offset(&self, worker: WorkerId) -> Result<u64, EventLogError>;
}

/// In-memory event log for tests and single-process use.
pub struct InMemoryEventLog {
    partitions: Mutex<HashMap<WorkerId, Vec<LogEvent>>>,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, worker: WorkerId, payload: Vec<u8>) -> Result<u64, EventLogError> {
        let mut partitions = self.partitions.lock().await;
        let partition = partitions.entry(worker).or_default();
        let offset = partition.len() as u64;
        partition.push(LogEvent { offset, payload });
        Ok(offset)
    }

    async fn replay(&self, worker: WorkerId, from: u64) -> Result<Vec<LogEvent>, EventLogError> {
        let partitions = self.partitions.lock().await;
        let partition = partitions
            .get(&worker)
            .ok_or(EventLogError::UnknownPartition(worker))?;
        Ok(partition
            .iter()
            .filter(|e| e.offset >= from)
            .cloned()
            .collect())
    }

    async fn next_offset(&self, worker: WorkerId) -> Result<u64, EventLogError> {
        let partitions = self.partitions.lock().await;
        Ok(partitions.get(&worker).map_or(0, |p| p.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_assigns_sequential_offsets() {
        let log = InMemoryEventLog::new();
        let w = WorkerId::new(0);
        assert_eq!(log.append(w, b"a".to_vec()).await.unwrap(), 0);
        assert_eq!(log.append(w, b"b".to_vec()).await.unwrap(), 1);
        assert_eq!(log.next_offset(w).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn replay_resumes_from_offset() {
        let log = InMemoryEventLog::new();
        let w = WorkerId::new(1);
        for payload in [b"a", b"b", b"c"] {
            log.append(w, payload.to_vec()).await.unwrap();
        }
        let events = log.replay(w, 1).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].offset, 1);
        assert_eq!(events[0].payload, b"b");
        assert_eq!(events[1].offset, 2);
    }

    #[tokio::test]
    async fn partitions_are_independent() {
        let log = InMemoryEventLog::new();
        log.append(WorkerId::new(0), b"a".to_vec()).await.unwrap();
        assert_eq!(log.append(WorkerId::new(1), b"x".to_vec()).await.unwrap(), 0);
        let err = log.replay(WorkerId::new(2), 0).await.unwrap_err();
        assert!(matches!(err, EventLogError::UnknownPartition(_)));
    }
}
