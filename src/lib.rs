//! # Snapweave
//!
//! Checkpointing and recovery for distributed stateful dataflow workers.
//!
//! Snapweave makes in-memory worker state durable and recoverable after
//! failure while keeping the pipeline live. Two protocols are supported,
//! selected once at startup from [`config::CheckpointConfig`]:
//!
//! - **Coordinated**: the coordinator assigns monotonically increasing
//!   epochs, broadcasts snapshot barriers to all alive workers, collects
//!   acknowledgments, and publishes complete epochs to a durable manifest.
//!   All workers recover from the same epoch.
//! - **Uncoordinated**: each worker snapshots on its own timer, independent
//!   of peers and of coordinator availability. Recovery resumes each worker
//!   from its own latest snapshot plus event-log replay.
//!
//! ## Key Components
//!
//! - [`store::SnapshotStore`]: the durable blob-storage contract (put/get/
//!   list/delete, atomic writes, no overwrite of history)
//! - [`engine::WorkerSnapshotEngine`]: per-worker capture, serialize, and
//!   durable write with bounded retry
//! - [`heartbeat::HeartbeatMonitor`]: liveness tracking and dead-worker
//!   detection
//! - [`epoch::EpochManager`]: the coordinated barrier state machine
//! - [`compactor::Compactor`]: pruning of superseded snapshot generations
//! - [`recovery::RecoveryManager`]: recovery-point selection and replay
//! - [`coordinator::Coordinator`]: the owner task tying it all together

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Compaction of superseded snapshot generations.
pub mod compactor;
/// Process-level configuration and strategy selection.
pub mod config;
/// Coordinator owner task and message-passing handle.
pub mod coordinator;
/// Worker-side snapshot engine.
pub mod engine;
/// Coordinated epoch state machine.
pub mod epoch;
/// Append-only event log collaborator.
pub mod event_log;
/// Heartbeat-based worker liveness tracking.
pub mod heartbeat;
/// Durable manifest of resolved epochs.
pub mod manifest;
/// Core identifiers and snapshot records.
pub mod record;
/// Recovery point selection and replay.
pub mod recovery;
/// Snapshot store client contract and built-in backends.
pub mod store;
/// Worker-side runtime loop.
pub mod worker;

#[cfg(test)]
mod coordinator_test;

/// Installs a `tracing` subscriber reading `RUST_LOG`-style filters from the
/// environment. Call once at startup; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
