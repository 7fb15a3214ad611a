//! Coordinator owner task.
//!
//! The liveness table, epoch state machine, and manifest live inside a single
//! task that consumes [`CoordinatorMessage`]s from an mpsc queue. Heartbeat
//! scans, epoch triggers, and compaction run as independent timer tasks that
//! send tick messages into the same queue, so no component ever mutates
//! shared state directly. Outbound protocol traffic (barrier requests, epoch
//! resolutions, liveness transitions) is published on an event channel for
//! the transport layer to deliver.

use crate::compactor::Compactor;
use crate::config::{CheckpointConfig, CheckpointStrategy};
use crate::epoch::{BarrierRequest, EpochError, EpochManager, EpochOutcome, EpochPhase};
use crate::event_log::EventLog;
use crate::heartbeat::{HeartbeatConfig, HeartbeatMonitor, LivenessEvent};
use crate::manifest::SnapshotManifest;
use crate::record::{Epoch, SnapshotRecord, WorkerId};
use crate::recovery::{RecoveryError, RecoveryManager, RecoveryPoint};
use crate::store::SnapshotStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Error type for coordinator handle operations.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The coordinator task has stopped; no further messages are accepted.
    #[error("coordinator stopped")]
    Stopped,
}

/// Messages consumed by the coordinator owner task.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// A worker registered (or re-registered) with the cluster.
    Register(WorkerId),
    /// A worker left the cluster.
    Deregister(WorkerId),
    /// Periodic liveness ping from a worker.
    Heartbeat(WorkerId),
    /// A worker acknowledged a coordinated barrier with its record.
    SnapshotAck {
        /// Epoch being acknowledged.
        epoch: Epoch,
        /// The durable record produced for it.
        record: SnapshotRecord,
    },
    /// Non-blocking completion notice from an uncoordinated worker, for
    /// monitoring only.
    SnapshotCompleted(SnapshotRecord),
    /// Liveness scan timer fired.
    LivenessTick,
    /// Epoch trigger timer fired.
    EpochTick,
    /// Compaction timer fired.
    CompactionTick,
    /// Status query.
    QueryStatus(oneshot::Sender<CoordinatorStatus>),
    /// Recovery-point query.
    QueryRecoveryPoint(oneshot::Sender<Result<RecoveryPoint, RecoveryError>>),
    /// Stop the owner task.
    Shutdown,
}

/// Outbound protocol events for the transport layer to deliver.
#[derive(Clone, Debug)]
pub enum CoordinatorEvent {
    /// Broadcast this barrier to every listed worker.
    BarrierRequest(BarrierRequest),
    /// The epoch resolved complete and is a valid recovery point.
    EpochCompleted(Epoch),
    /// The epoch was abandoned incomplete.
    EpochAbandoned(Epoch),
    /// A worker was declared dead and excluded.
    WorkerDead(WorkerId),
    /// A dead worker resumed heartbeats.
    WorkerRecovered(WorkerId),
}

/// Snapshot of coordinator state for status queries.
#[derive(Clone, Debug)]
pub struct CoordinatorStatus {
    /// Configured strategy.
    pub strategy: CheckpointStrategy,
    /// Protocol phase of the coordinated state machine.
    pub phase: EpochPhase,
    /// Epoch currently collecting acks, if any.
    pub current_epoch: Option<Epoch>,
    /// Highest complete epoch, if any.
    pub latest_complete_epoch: Option<Epoch>,
    /// Workers currently alive.
    pub alive: Vec<WorkerId>,
    /// Workers currently dead.
    pub dead: Vec<WorkerId>,
    /// How long the in-flight epoch has been pending.
    pub stalled_for: Option<Duration>,
}

/// Cloneable handle for sending messages to the coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorMessage>,
}

impl CoordinatorHandle {
    /// Registers a worker.
    pub async fn register(&self, worker: WorkerId) -> Result<(), CoordinatorError> {
        self.send(CoordinatorMessage::Register(worker)).await
    }

    /// Deregisters a worker.
    pub async fn deregister(&self, worker: WorkerId) -> Result<(), CoordinatorError> {
        self.send(CoordinatorMessage::Deregister(worker)).await
    }

    /// Records a heartbeat.
    pub async fn heartbeat(&self, worker: WorkerId) -> Result<(), CoordinatorError> {
        self.send(CoordinatorMessage::Heartbeat(worker)).await
    }

    /// Acknowledges a coordinated barrier.
    pub async fn snapshot_ack(
        &self,
        epoch: Epoch,
        record: SnapshotRecord,
    ) -> Result<(), CoordinatorError> {
        self.send(CoordinatorMessage::SnapshotAck { epoch, record }).await
    }

    /// Reports an uncoordinated snapshot completion without blocking: the
    /// notice is dropped if the queue is full or the coordinator is down,
    /// because coordinator availability is never a liveness dependency for
    /// uncoordinated workers.
    pub fn snapshot_completed(&self, record: SnapshotRecord) {
        let _ = self
            .tx
            .try_send(CoordinatorMessage::SnapshotCompleted(record));
    }

    /// Returns the coordinator's current status.
    pub async fn status(&self) -> Result<CoordinatorStatus, CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CoordinatorMessage::QueryStatus(reply_tx)).await?;
        reply_rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    /// Returns the recovery point the coordinator would select right now.
    pub async fn recovery_point(&self) -> Result<Result<RecoveryPoint, RecoveryError>, CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CoordinatorMessage::QueryRecoveryPoint(reply_tx)).await?;
        reply_rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    /// Stops the coordinator task.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.send(CoordinatorMessage::Shutdown).await
    }

    async fn send(&self, msg: CoordinatorMessage) -> Result<(), CoordinatorError> {
        self.tx.send(msg).await.map_err(|_| CoordinatorError::Stopped)
    }
}

/// The coordinator state machine and its owned tables.
pub struct Coordinator {
    config: CheckpointConfig,
    liveness: HeartbeatMonitor,
    epochs: EpochManager,
    manifest: SnapshotManifest,
    store: Arc<dyn SnapshotStore>,
    log: Arc<dyn EventLog>,
    compactor: Compactor,
    events_tx: mpsc::Sender<CoordinatorEvent>,
}

impl Coordinator {
    /// Creates a coordinator. Outbound protocol events are published on the
    /// returned receiver's channel.
    pub fn new(
        config: CheckpointConfig,
        store: Arc<dyn SnapshotStore>,
        log: Arc<dyn EventLog>,
    ) -> (Self, mpsc::Receiver<CoordinatorEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let liveness = HeartbeatMonitor::new(HeartbeatConfig::new(
            config.heartbeat_timeout,
            config.heartbeat_check_interval,
        ));
        let compactor = Compactor::new(store.clone());
        (
            Self {
                config,
                liveness,
                epochs: EpochManager::new(),
                manifest: SnapshotManifest::new(),
                store,
                log,
                compactor,
                events_tx,
            },
            events_rx,
        )
    }

    /// Loads the persisted manifest, resuming epoch numbering after the
    /// highest recorded epoch. Call before [`spawn`](Self::spawn) when
    /// restarting over an existing store.
    pub async fn load_manifest(&mut self) -> Result<(), crate::manifest::ManifestError> {
        self.manifest = SnapshotManifest::load(self.store.as_ref()).await?;
        let last = self
            .manifest
            .complete_epochs()
            .into_iter()
            .chain(self.manifest.incomplete_epochs())
            .max();
        if let Some(last) = last {
            self.epochs = EpochManager::resuming_after(last);
            info!(resumed_after = last.as_u64(), "manifest loaded, resuming epoch numbering");
        }
        Ok(())
    }

    /// Spawns the owner task and its timer tasks, returning the handle.
    pub fn spawn(self) -> CoordinatorHandle {
        let (tx, rx) = mpsc::channel(256);

        spawn_ticker(
            tx.clone(),
            self.config.heartbeat_check_interval,
            || CoordinatorMessage::LivenessTick,
        );
        if self.config.strategy == CheckpointStrategy::Coordinated {
            spawn_ticker(tx.clone(), self.config.snapshot_frequency, || {
                CoordinatorMessage::EpochTick
            });
        }
        spawn_ticker(tx.clone(), self.config.compaction_interval, || {
            CoordinatorMessage::CompactionTick
        });

        tokio::spawn(self.run(rx));
        CoordinatorHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<CoordinatorMessage>) {
        info!(strategy = %self.config.strategy, "coordinator started");
        while let Some(msg) = rx.recv().await {
            if matches!(msg, CoordinatorMessage::Shutdown) {
                info!("coordinator shutting down");
                break;
            }
            self.handle(msg).await;
        }
    }

    async fn handle(&mut self, msg: CoordinatorMessage) {
        match msg {
            CoordinatorMessage::Register(worker) => {
                info!(worker = %worker, "worker registered");
                self.liveness.register(worker);
            }
            CoordinatorMessage::Deregister(worker) => {
                info!(worker = %worker, "worker deregistered");
                self.liveness.deregister(worker);
            }
            CoordinatorMessage::Heartbeat(worker) => {
                if let Some(LivenessEvent::WorkerRecovered(w)) = self.liveness.heartbeat(worker) {
                    info!(worker = %w, "worker recovered");
                    self.emit(CoordinatorEvent::WorkerRecovered(w)).await;
                }
            }
            CoordinatorMessage::SnapshotAck { epoch, record } => {
                debug!(epoch = epoch.as_u64(), worker = %record.worker_id, "snapshot ack");
                let outcome = self.epochs.record_ack(epoch, record);
                self.resolve_outcome(outcome).await;
            }
            CoordinatorMessage::SnapshotCompleted(record) => {
                info!(
                    worker = %record.worker_id,
                    key = %record.storage_key,
                    "uncoordinated snapshot completed"
                );
            }
            CoordinatorMessage::LivenessTick => self.on_liveness_tick().await,
            CoordinatorMessage::EpochTick => self.on_epoch_tick().await,
            CoordinatorMessage::CompactionTick => self.on_compaction_tick().await,
            CoordinatorMessage::QueryStatus(reply) => {
                let _ = reply.send(self.status());
            }
            CoordinatorMessage::QueryRecoveryPoint(reply) => {
                let _ = reply.send(self.select_recovery_point().await);
            }
            CoordinatorMessage::Shutdown => {}
        }
    }

    async fn on_liveness_tick(&mut self) {
        for event in self.liveness.scan() {
            match event {
                LivenessEvent::WorkerDead(worker) => {
                    warn!(worker = %worker, "worker declared dead");
                    self.emit(CoordinatorEvent::WorkerDead(worker)).await;
                    let outcome = self.epochs.worker_dead(worker);
                    self.resolve_outcome(outcome).await;
                }
                LivenessEvent::WorkerSuspect(worker) => {
                    info!(worker = %worker, "worker suspect");
                }
                LivenessEvent::WorkerRecovered(worker) => {
                    self.emit(CoordinatorEvent::WorkerRecovered(worker)).await;
                }
            }
        }
        // A round that outlives its own trigger period with no progress and
        // no dead worker to shrink the required set is stalled; surface it
        // for operators rather than retrying the barrier.
        if let Some(stalled) = self.epochs.stalled_for(Utc::now()) {
            if stalled > self.config.snapshot_frequency {
                warn!(
                    epoch = self.epochs.current_epoch().map(Epoch::as_u64),
                    stalled_ms = stalled.as_millis() as u64,
                    "epoch stalled waiting for acks"
                );
            }
        }
    }

    async fn on_epoch_tick(&mut self) {
        // One epoch in flight at a time: the timer only starts a round after
        // the previous one resolved.
        if self.epochs.in_flight() {
            debug!(
                epoch = self.epochs.current_epoch().map(Epoch::as_u64),
                "epoch trigger skipped, previous round still pending"
            );
            return;
        }
        match self.epochs.begin_epoch(&self.liveness.alive_workers()) {
            Ok(request) => {
                info!(
                    epoch = request.epoch.as_u64(),
                    workers = request.workers.len(),
                    "snapshot barrier requested"
                );
                self.emit(CoordinatorEvent::BarrierRequest(request)).await;
                self.epochs.barrier_sent();
            }
            Err(EpochError::NoAliveWorkers) => {
                debug!("epoch trigger skipped, no alive workers");
            }
            Err(EpochError::EpochInFlight(_)) => {}
        }
    }

    async fn on_compaction_tick(&mut self) {
        match self.config.strategy {
            CheckpointStrategy::Coordinated => {
                self.compactor.compact_coordinated(&mut self.manifest).await;
            }
            CheckpointStrategy::Uncoordinated => {
                let workers = self.liveness.registered_workers();
                self.compactor.compact_uncoordinated(&workers).await;
            }
        }
    }

    async fn resolve_outcome(&mut self, outcome: Option<EpochOutcome>) {
        let entry = match outcome {
            Some(EpochOutcome::Completed(entry)) => {
                info!(
                    epoch = entry.epoch.as_u64(),
                    records = entry.records.len(),
                    "epoch complete"
                );
                self.emit(CoordinatorEvent::EpochCompleted(entry.epoch)).await;
                entry
            }
            Some(EpochOutcome::Abandoned(entry)) => {
                self.emit(CoordinatorEvent::EpochAbandoned(entry.epoch)).await;
                entry
            }
            None => return,
        };
        let completed = entry.is_complete();
        if let Err(e) = SnapshotManifest::persist_entry(self.store.as_ref(), &entry).await {
            error!(epoch = entry.epoch.as_u64(), error = %e, "failed to persist manifest entry");
        }
        if let Err(e) = self.manifest.record_entry(entry) {
            error!(error = %e, "failed to record manifest entry");
        }
        // Completion signals the compactor directly; the interval pass also
        // picks this up if the inline pass fails.
        if completed {
            self.compactor.compact_coordinated(&mut self.manifest).await;
        }
    }

    async fn select_recovery_point(&self) -> Result<RecoveryPoint, RecoveryError> {
        let recovery = RecoveryManager::new(self.store.clone(), self.log.clone());
        match self.config.strategy {
            CheckpointStrategy::Coordinated => recovery.select_coordinated(&self.manifest),
            CheckpointStrategy::Uncoordinated => {
                recovery
                    .select_uncoordinated(&self.liveness.registered_workers())
                    .await
            }
        }
    }

    fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            strategy: self.config.strategy,
            phase: self.epochs.phase(),
            current_epoch: self.epochs.current_epoch(),
            latest_complete_epoch: self.manifest.latest_complete().map(|e| e.epoch),
            alive: self.liveness.alive_workers(),
            dead: self.liveness.dead_workers(),
            stalled_for: self.epochs.stalled_for(Utc::now()),
        }
    }

    async fn emit(&self, event: CoordinatorEvent) {
        if self.events_tx.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }
}

fn spawn_ticker<F>(tx: mpsc::Sender<CoordinatorMessage>, period: Duration, make: F)
where
    F: Fn() -> CoordinatorMessage + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the first real period
        // elapses before any scan or barrier.
        interval.tick().await;
        loop {
            interval.tick().await;
            if tx.send(make()).await.is_err() {
                break;
            }
        }
    });
}
