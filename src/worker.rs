//! Worker-side runtime loop.
//!
//! Ties one worker's snapshot engine to the coordinator: periodic
//! heartbeats, barrier handling (coordinated), and the local snapshot timer
//! (uncoordinated). Event processing runs elsewhere; nothing here blocks it:
//! the loop only briefly freezes state through
//! [`SnapshotSource::capture`](crate::engine::SnapshotSource::capture) and in
//! uncoordinated mode never waits on any other worker or on the coordinator.

use crate::config::CheckpointStrategy;
use crate::coordinator::CoordinatorHandle;
use crate::engine::{SnapshotError, SnapshotSource, SnapshotTrigger, WorkerSnapshotEngine};
use crate::epoch::BarrierRequest;
use crate::record::WorkerId;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Runtime loop for one worker's checkpointing duties.
pub struct WorkerRuntime<S: SnapshotSource> {
    engine: WorkerSnapshotEngine<S>,
    coordinator: CoordinatorHandle,
    strategy: CheckpointStrategy,
    heartbeat_interval: Duration,
    local_timer_interval: Duration,
}

impl<S: SnapshotSource> WorkerRuntime<S> {
    /// Creates a runtime for one worker.
    pub fn new(
        engine: WorkerSnapshotEngine<S>,
        coordinator: CoordinatorHandle,
        strategy: CheckpointStrategy,
    ) -> Self {
        Self {
            engine,
            coordinator,
            strategy,
            heartbeat_interval: Duration::from_secs(1),
            local_timer_interval: Duration::from_secs(10),
        }
    }

    /// Sets the heartbeat cadence.
    pub fn with_heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = d;
        self
    }

    /// Sets the uncoordinated local snapshot cadence.
    pub fn with_local_timer_interval(mut self, d: Duration) -> Self {
        self.local_timer_interval = d;
        self
    }

    /// Returns this runtime's worker id.
    pub fn worker_id(&self) -> WorkerId {
        self.engine.worker_id()
    }

    /// Handles one barrier request: snapshot at the requested epoch and
    /// acknowledge.
    ///
    /// Exhausted write retries abandon the attempt with a warning; the
    /// coordinator will complete the epoch without this worker only once it
    /// is declared dead, so a skipped barrier surfaces as a stalled epoch.
    pub async fn handle_barrier(&mut self, request: &BarrierRequest) -> Result<(), SnapshotError> {
        if !request.workers.contains(&self.worker_id()) {
            return Ok(());
        }
        match self
            .engine
            .take_snapshot(SnapshotTrigger::Epoch(request.epoch))
            .await
        {
            Ok(record) => {
                if self
                    .coordinator
                    .snapshot_ack(request.epoch, record)
                    .await
                    .is_err()
                {
                    warn!(worker = %self.worker_id(), "coordinator unavailable for ack");
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(worker = %self.worker_id(), error = %e, "barrier snapshot abandoned");
                Ok(())
            }
        }
    }

    /// Takes one local-timer snapshot if due, notifying the coordinator
    /// without blocking on it.
    pub async fn tick_local(&mut self) -> Result<(), SnapshotError> {
        if !self.engine.should_snapshot() {
            return Ok(());
        }
        match self.engine.take_snapshot(SnapshotTrigger::LocalTimer).await {
            Ok(record) => {
                // Monitoring only; dropped if the coordinator is away.
                self.coordinator.snapshot_completed(record);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(worker = %self.worker_id(), error = %e, "local snapshot abandoned, continuing on previous baseline");
                Ok(())
            }
        }
    }

    /// Registers with the coordinator and runs until `barrier_rx` closes or
    /// a fatal snapshot error escalates.
    ///
    /// Returns `Err` only for failures that require restarting the worker.
    pub async fn run(
        mut self,
        mut barrier_rx: mpsc::Receiver<BarrierRequest>,
    ) -> Result<(), SnapshotError> {
        let worker = self.worker_id();
        if self.coordinator.register(worker).await.is_err() {
            warn!(worker = %worker, "coordinator unavailable at registration");
        }
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        let mut local_timer = tokio::time::interval(self.local_timer_interval);
        info!(worker = %worker, strategy = %self.strategy, "worker runtime started");
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if self.coordinator.heartbeat(worker).await.is_err() {
                        warn!(worker = %worker, "coordinator unavailable for heartbeat");
                    }
                }
                _ = local_timer.tick(), if self.strategy == CheckpointStrategy::Uncoordinated => {
                    self.tick_local().await?;
                }
                request = barrier_rx.recv() => {
                    match request {
                        Some(request) => self.handle_barrier(&request).await?,
                        None => {
                            info!(worker = %worker, "barrier channel closed, worker runtime stopping");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckpointConfig;
    use crate::coordinator::Coordinator;
    use crate::engine::CapturedState;
    use crate::event_log::InMemoryEventLog;
    use crate::record::LocalSeq;
    use crate::store::{InMemorySnapshotStore, SnapshotStore, StoreError};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct StaticSource;

    impl SnapshotSource for StaticSource {
        type State = Vec<u64>;

        fn capture(&self) -> Result<CapturedState<Self::State>, SnapshotError> {
            Ok(CapturedState {
                state: vec![1, 2, 3],
                log_offset: 0,
            })
        }
    }

    /// Store whose puts stall for a long time for one worker's keys.
    struct StallingStore {
        inner: InMemorySnapshotStore,
        stall_prefix: String,
    }

    #[async_trait]
    impl SnapshotStore for StallingStore {
        async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
            if key.starts_with(&self.stall_prefix) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.inner.put(key, bytes).await
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
            self.inner.get(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list(prefix).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
    }

    fn uncoordinated_handle(store: Arc<dyn SnapshotStore>) -> CoordinatorHandle {
        let config = CheckpointConfig::default()
            .with_strategy(CheckpointStrategy::Uncoordinated)
            .with_compaction_interval(Duration::from_secs(3600))
            .with_heartbeat_check_interval(Duration::from_secs(3600));
        let (coordinator, _events) =
            Coordinator::new(config, store, Arc::new(InMemoryEventLog::new()));
        coordinator.spawn()
    }

    #[tokio::test]
    async fn no_worker_blocks_on_anothers_snapshot() {
        // Worker 0's store writes hang forever; worker 1 must still complete
        // its own local snapshots.
        let store = Arc::new(StallingStore {
            inner: InMemorySnapshotStore::new(),
            stall_prefix: crate::record::uncoordinated_prefix(WorkerId::new(0)),
        });
        let handle = uncoordinated_handle(store.clone());

        let mut stalled = WorkerRuntime::new(
            WorkerSnapshotEngine::new(WorkerId::new(0), StaticSource, store.clone()),
            handle.clone(),
            CheckpointStrategy::Uncoordinated,
        );
        let mut free = WorkerRuntime::new(
            WorkerSnapshotEngine::new(WorkerId::new(1), StaticSource, store.clone()),
            handle.clone(),
            CheckpointStrategy::Uncoordinated,
        );

        let stalled_task = tokio::spawn(async move { stalled.tick_local().await });
        // Give the stalled write time to start hanging.
        tokio::time::sleep(Duration::from_millis(50)).await;

        free.tick_local().await.unwrap();
        let keys = store
            .list(&crate::record::uncoordinated_prefix(WorkerId::new(1)))
            .await
            .unwrap();
        assert_eq!(keys.len(), 1);
        assert!(!stalled_task.is_finished());
        stalled_task.abort();
    }

    #[tokio::test]
    async fn barrier_for_other_workers_is_ignored() {
        let store = Arc::new(InMemorySnapshotStore::new());
        let handle = uncoordinated_handle(store.clone());
        let mut runtime = WorkerRuntime::new(
            WorkerSnapshotEngine::new(WorkerId::new(5), StaticSource, store.clone()),
            handle,
            CheckpointStrategy::Coordinated,
        );
        let request = BarrierRequest {
            epoch: crate::record::Epoch::new(1),
            workers: vec![WorkerId::new(0), WorkerId::new(1)],
        };
        runtime.handle_barrier(&request).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn local_snapshots_advance_sequence() {
        let store = Arc::new(InMemorySnapshotStore::new());
        let handle = uncoordinated_handle(store.clone());
        let engine = WorkerSnapshotEngine::new(WorkerId::new(2), StaticSource, store.clone())
            .with_snapshot_interval(Duration::ZERO);
        let mut runtime = WorkerRuntime::new(
            engine,
            handle,
            CheckpointStrategy::Uncoordinated,
        );
        runtime.tick_local().await.unwrap();
        runtime.tick_local().await.unwrap();
        assert_eq!(runtime.engine.next_seq(), LocalSeq::new(2));
    }
}
