//! Heartbeat-based worker liveness tracking.
//!
//! The coordinator records a last-seen timestamp per worker from periodic
//! pings. A background scan marks workers silent longer than the configured
//! limit as dead, which excludes them from in-flight epochs and triggers
//! recovery handling. A heartbeat from a suspect or dead worker resets it to
//! alive.

use crate::record::WorkerId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Liveness status of a registered worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerStatus {
    /// Heartbeats arriving within the configured limits.
    Alive,
    /// Silent longer than the suspect threshold; advisory only.
    Suspect,
    /// Silent longer than the dead limit; excluded from epochs.
    Dead,
}

/// Per-worker liveness state.
#[derive(Clone, Copy, Debug)]
pub struct WorkerLiveness {
    /// When the last heartbeat arrived (or the worker registered).
    pub last_heartbeat: DateTime<Utc>,
    /// Current status as of the last scan or heartbeat.
    pub status: WorkerStatus,
}

/// Configuration for liveness detection.
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatConfig {
    /// A worker silent longer than this is marked dead at the next scan.
    pub dead_after: Duration,
    /// Interval between background liveness scans.
    pub check_interval: Duration,
    /// A worker silent longer than this (but within `dead_after`) is marked
    /// suspect.
    pub suspect_after: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            dead_after: Duration::from_secs(30),
            check_interval: Duration::from_secs(10),
            suspect_after: Duration::from_secs(15),
        }
    }
}

impl HeartbeatConfig {
    /// Creates a config from the dead limit and scan interval, deriving the
    /// suspect threshold as half the dead limit.
    pub fn new(dead_after: Duration, check_interval: Duration) -> Self {
        Self {
            dead_after,
            check_interval,
            suspect_after: dead_after / 2,
        }
    }

    /// Sets the suspect threshold.
    pub fn with_suspect_after(mut self, d: Duration) -> Self {
        self.suspect_after = d;
        self
    }
}

/// Liveness transition observed by a scan or heartbeat.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LivenessEvent {
    /// Worker crossed the suspect threshold.
    WorkerSuspect(WorkerId),
    /// Worker crossed the dead limit and is now excluded.
    WorkerDead(WorkerId),
    /// A previously dead worker resumed heartbeats.
    WorkerRecovered(WorkerId),
}

/// Tracks per-worker liveness from heartbeats and periodic scans.
///
/// Pure state machine: `heartbeat_at` and `scan_at` take an explicit `now` so
/// transitions are deterministic under test; the wall-clock wrappers are what
/// the coordinator task calls.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    workers: HashMap<WorkerId, WorkerLiveness>,
}

impl HeartbeatMonitor {
    /// Creates a monitor with the given config and no registered workers.
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            workers: HashMap::new(),
        }
    }

    /// Returns the config.
    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Registers a worker as alive as of `now`.
    pub fn register_at(&mut self, worker: WorkerId, now: DateTime<Utc>) {
        self.workers.insert(
            worker,
            WorkerLiveness {
                last_heartbeat: now,
                status: WorkerStatus::Alive,
            },
        );
    }

    /// Registers a worker as alive as of the current wall clock.
    pub fn register(&mut self, worker: WorkerId) {
        self.register_at(worker, Utc::now());
    }

    /// Removes a worker from the liveness table.
    pub fn deregister(&mut self, worker: WorkerId) {
        self.workers.remove(&worker);
    }

    /// Records a heartbeat at `now`. Unknown workers are registered.
    /// Returns `WorkerRecovered` when a dead worker resumes.
    pub fn heartbeat_at(&mut self, worker: WorkerId, now: DateTime<Utc>) -> Option<LivenessEvent> {
        match self.workers.get_mut(&worker) {
            Some(state) => {
                let was_dead = state.status == WorkerStatus::Dead;
                state.last_heartbeat = now;
                state.status = WorkerStatus::Alive;
                was_dead.then_some(LivenessEvent::WorkerRecovered(worker))
            }
            None => {
                self.register_at(worker, now);
                None
            }
        }
    }

    /// Records a heartbeat at the current wall clock.
    pub fn heartbeat(&mut self, worker: WorkerId) -> Option<LivenessEvent> {
        self.heartbeat_at(worker, Utc::now())
    }

    /// Scans the liveness table at `now`, returning the transitions.
    ///
    /// A worker silent longer than `dead_after` becomes dead at this scan,
    /// never earlier; one silent longer than `suspect_after` becomes suspect.
    pub fn scan_at(&mut self, now: DateTime<Utc>) -> Vec<LivenessEvent> {
        let dead_after = chrono_duration(self.config.dead_after);
        let suspect_after = chrono_duration(self.config.suspect_after);
        let mut events = Vec::new();
        for (worker, state) in &mut self.workers {
            let silent = now.signed_duration_since(state.last_heartbeat);
            match state.status {
                WorkerStatus::Dead => {}
                _ if silent > dead_after => {
                    state.status = WorkerStatus::Dead;
                    events.push(LivenessEvent::WorkerDead(*worker));
                }
                WorkerStatus::Alive if silent > suspect_after => {
                    state.status = WorkerStatus::Suspect;
                    events.push(LivenessEvent::WorkerSuspect(*worker));
                }
                _ => {}
            }
        }
        events
    }

    /// Scans at the current wall clock.
    pub fn scan(&mut self) -> Vec<LivenessEvent> {
        self.scan_at(Utc::now())
    }

    /// Returns a worker's current status.
    pub fn status(&self, worker: WorkerId) -> Option<WorkerStatus> {
        self.workers.get(&worker).map(|s| s.status)
    }

    /// Returns all workers currently alive, in id order.
    pub fn alive_workers(&self) -> Vec<WorkerId> {
        let mut alive: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, s)| s.status == WorkerStatus::Alive)
            .map(|(w, _)| *w)
            .collect();
        alive.sort();
        alive
    }

    /// Returns all workers currently dead, in id order.
    pub fn dead_workers(&self) -> Vec<WorkerId> {
        let mut dead: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, s)| s.status == WorkerStatus::Dead)
            .map(|(w, _)| *w)
            .collect();
        dead.sort();
        dead
    }

    /// Returns all registered workers, in id order.
    pub fn registered_workers(&self) -> Vec<WorkerId> {
        let mut all: Vec<WorkerId> = self.workers.keys().copied().collect();
        all.sort();
        all
    }

    /// Returns the liveness state for a worker.
    pub fn liveness(&self, worker: WorkerId) -> Option<&WorkerLiveness> {
        self.workers.get(&worker)
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::MAX)
}
