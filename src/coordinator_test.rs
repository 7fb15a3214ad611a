//! Cross-component tests for the coordinator task and both strategies.

use crate::config::{CheckpointConfig, CheckpointStrategy};
use crate::coordinator::{Coordinator, CoordinatorEvent, CoordinatorHandle};
use crate::engine::{CapturedState, SnapshotError, SnapshotSource, SnapshotTrigger, WorkerSnapshotEngine};
use crate::epoch::BarrierRequest;
use crate::event_log::{EventLog, InMemoryEventLog};
use crate::record::{Epoch, WorkerId};
use crate::recovery::{RecoveryManager, RecoveryPoint};
use crate::store::InMemorySnapshotStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct KvSource {
    entries: HashMap<String, u64>,
    log_offset: u64,
}

impl KvSource {
    fn new(seed: u64) -> Self {
        let mut entries = HashMap::new();
        entries.insert("seed".to_string(), seed);
        Self {
            entries,
            log_offset: seed,
        }
    }
}

impl SnapshotSource for KvSource {
    type State = HashMap<String, u64>;

    fn capture(&self) -> Result<CapturedState<Self::State>, SnapshotError> {
        Ok(CapturedState {
            state: self.entries.clone(),
            log_offset: self.log_offset,
        })
    }
}

fn coordinated_config() -> CheckpointConfig {
    CheckpointConfig::default()
        .with_snapshot_frequency(Duration::from_millis(50))
        .with_heartbeat_timeout(Duration::from_millis(150))
        .with_heartbeat_check_interval(Duration::from_millis(25))
        .with_compaction_interval(Duration::from_secs(3600))
}

async fn next_barrier(
    events: &mut mpsc::Receiver<CoordinatorEvent>,
) -> BarrierRequest {
    loop {
        match timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for barrier")
            .expect("event channel closed")
        {
            CoordinatorEvent::BarrierRequest(request) => return request,
            _ => continue,
        }
    }
}

async fn next_completion(events: &mut mpsc::Receiver<CoordinatorEvent>) -> Epoch {
    loop {
        match timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for completion")
            .expect("event channel closed")
        {
            CoordinatorEvent::EpochCompleted(epoch) => return epoch,
            _ => continue,
        }
    }
}

fn spawn_heartbeats(handle: CoordinatorHandle, worker: WorkerId) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(20));
        loop {
            interval.tick().await;
            if handle.heartbeat(worker).await.is_err() {
                break;
            }
        }
    })
}

#[tokio::test]
async fn coordinated_round_trip_through_coordinator() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let log = Arc::new(InMemoryEventLog::new());
    for worker in [0u32, 1] {
        for i in 0..5u64 {
            log.append(WorkerId::new(worker), vec![i as u8]).await.unwrap();
        }
    }
    let (coordinator, mut events) = Coordinator::new(coordinated_config(), store.clone(), log.clone());
    let handle = coordinator.spawn();

    let workers = [WorkerId::new(0), WorkerId::new(1)];
    let mut pumps = Vec::new();
    for worker in workers {
        handle.register(worker).await.unwrap();
        pumps.push(spawn_heartbeats(handle.clone(), worker));
    }

    let request = next_barrier(&mut events).await;
    assert_eq!(request.workers.len(), 2);

    // Each worker snapshots at the barrier and acknowledges.
    for worker in workers {
        let mut engine = WorkerSnapshotEngine::new(
            worker,
            KvSource::new(3),
            store.clone(),
        );
        let record = engine
            .take_snapshot(SnapshotTrigger::Epoch(request.epoch))
            .await
            .unwrap();
        handle.snapshot_ack(request.epoch, record).await.unwrap();
    }

    let completed = next_completion(&mut events).await;
    assert_eq!(completed, request.epoch);

    let status = handle.status().await.unwrap();
    assert_eq!(status.latest_complete_epoch, Some(request.epoch));
    assert_eq!(status.strategy, CheckpointStrategy::Coordinated);

    // The recovery query resolves to that epoch, and replay instructions
    // resume every worker from its recorded offset.
    let point = handle.recovery_point().await.unwrap().unwrap();
    match &point {
        RecoveryPoint::Coordinated { epoch, records } => {
            assert_eq!(*epoch, completed);
            assert_eq!(records.len(), 2);
        }
        _ => panic!("expected coordinated recovery point"),
    }
    let recovery = RecoveryManager::new(store.clone(), log.clone());
    let recoveries = recovery.recover_all(&point).await.unwrap();
    for r in &recoveries {
        assert_eq!(r.replay_from, 3);
        assert_eq!(r.events.len(), 2);
    }

    for pump in pumps {
        pump.abort();
    }
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn epoch_completes_with_surviving_acks_when_worker_dies() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let log = Arc::new(InMemoryEventLog::new());
    let (coordinator, mut events) = Coordinator::new(coordinated_config(), store.clone(), log);
    let handle = coordinator.spawn();

    let survivors = [WorkerId::new(0), WorkerId::new(1)];
    let casualty = WorkerId::new(2);
    let mut pumps = Vec::new();
    for worker in survivors {
        handle.register(worker).await.unwrap();
        pumps.push(spawn_heartbeats(handle.clone(), worker));
    }
    // The casualty registers but never heartbeats again.
    handle.register(casualty).await.unwrap();

    let request = next_barrier(&mut events).await;
    for worker in survivors {
        if !request.workers.contains(&worker) {
            continue;
        }
        let mut engine = WorkerSnapshotEngine::new(worker, KvSource::new(1), store.clone());
        let record = engine
            .take_snapshot(SnapshotTrigger::Epoch(request.epoch))
            .await
            .unwrap();
        handle.snapshot_ack(request.epoch, record).await.unwrap();
    }

    // The casualty is declared dead by the liveness scan, the required set
    // shrinks, and the epoch completes with the surviving acks.
    let completed = next_completion(&mut events).await;
    assert_eq!(completed, request.epoch);

    // The death declaration and the completion race benignly when the
    // casualty was already suspect at barrier time; poll until the scan
    // lands.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = handle.status().await.unwrap();
        if status.dead.contains(&casualty) {
            assert_eq!(status.latest_complete_epoch, Some(completed));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "casualty never declared dead");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let point = handle.recovery_point().await.unwrap().unwrap();
    match point {
        RecoveryPoint::Coordinated { records, .. } => {
            assert!(records.iter().all(|r| r.worker_id != casualty));
        }
        _ => panic!("expected coordinated recovery point"),
    }

    for pump in pumps {
        pump.abort();
    }
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn uncoordinated_recovery_point_uses_latest_local_snapshots() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let log = Arc::new(InMemoryEventLog::new());
    for worker in [0u32, 1] {
        for i in 0..6u64 {
            log.append(WorkerId::new(worker), vec![i as u8]).await.unwrap();
        }
    }
    let config = CheckpointConfig::default()
        .with_strategy(CheckpointStrategy::Uncoordinated)
        .with_heartbeat_check_interval(Duration::from_secs(3600))
        .with_compaction_interval(Duration::from_secs(3600));
    let (coordinator, _events) = Coordinator::new(config, store.clone(), log.clone());
    let handle = coordinator.spawn();

    for worker in [WorkerId::new(0), WorkerId::new(1)] {
        handle.register(worker).await.unwrap();
    }

    // Workers snapshot on their own timers, at different paces.
    let mut engine0 = WorkerSnapshotEngine::new(WorkerId::new(0), KvSource::new(4), store.clone())
        .with_snapshot_interval(Duration::ZERO);
    engine0.take_snapshot(SnapshotTrigger::LocalTimer).await.unwrap();
    engine0.take_snapshot(SnapshotTrigger::LocalTimer).await.unwrap();
    let mut engine1 = WorkerSnapshotEngine::new(WorkerId::new(1), KvSource::new(2), store.clone());
    engine1.take_snapshot(SnapshotTrigger::LocalTimer).await.unwrap();

    let point = handle.recovery_point().await.unwrap().unwrap();
    let records = match &point {
        RecoveryPoint::Uncoordinated { records, fresh } => {
            assert!(fresh.is_empty());
            records.clone()
        }
        _ => panic!("expected uncoordinated recovery point"),
    };
    assert_eq!(records.len(), 2);
    let latest0 = records.iter().find(|r| r.worker_id == WorkerId::new(0)).unwrap();
    assert_eq!(latest0.storage_key, "uncoordinated/0/0000000001.bin");

    // Per-worker replay: workers resume at their own offsets.
    let recovery = RecoveryManager::new(store.clone(), log.clone());
    let recoveries = recovery.recover_all(&point).await.unwrap();
    let by_worker: HashMap<WorkerId, u64> = recoveries
        .iter()
        .map(|r| (r.worker_id, r.replay_from))
        .collect();
    assert_eq!(by_worker[&WorkerId::new(0)], 4);
    assert_eq!(by_worker[&WorkerId::new(1)], 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn coordinator_restart_resumes_epoch_numbering() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let log = Arc::new(InMemoryEventLog::new());
    let (coordinator, mut events) = Coordinator::new(coordinated_config(), store.clone(), log.clone());
    let handle = coordinator.spawn();

    let worker = WorkerId::new(0);
    handle.register(worker).await.unwrap();
    let pump = spawn_heartbeats(handle.clone(), worker);

    let request = next_barrier(&mut events).await;
    let mut engine = WorkerSnapshotEngine::new(worker, KvSource::new(1), store.clone());
    let record = engine
        .take_snapshot(SnapshotTrigger::Epoch(request.epoch))
        .await
        .unwrap();
    handle.snapshot_ack(request.epoch, record).await.unwrap();
    let completed = next_completion(&mut events).await;

    pump.abort();
    handle.shutdown().await.unwrap();

    // A restarted coordinator loads the manifest and never reuses an epoch.
    let (mut restarted, mut events) =
        Coordinator::new(coordinated_config(), store.clone(), log.clone());
    restarted.load_manifest().await.unwrap();
    let handle = restarted.spawn();
    handle.register(worker).await.unwrap();
    let pump = spawn_heartbeats(handle.clone(), worker);

    let status = handle.status().await.unwrap();
    assert_eq!(status.latest_complete_epoch, Some(completed));

    let request = next_barrier(&mut events).await;
    assert!(request.epoch > completed);

    pump.abort();
    handle.shutdown().await.unwrap();
}
