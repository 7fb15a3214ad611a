//! Core identifiers, snapshot records, and the durable object layout.
//!
//! A [`SnapshotRecord`] describes one durable snapshot generation: who wrote
//! it, what triggered it (a coordinated epoch or a local sequence number),
//! where it lives in the store, and the event-log offset it captured. Records
//! are immutable once written.
//!
//! Storage keys embed zero-padded numeric components so that lexicographic
//! key order equals creation order for a single worker's keys.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identifier of a partition-owning worker.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl WorkerId {
    /// Creates a worker id from a raw value.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw u32 value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global monotonic epoch counter for coordinated snapshot rounds.
///
/// Assigned only by the epoch manager; strictly increasing, assigned exactly
/// once per round.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Epoch(pub u64);

impl Epoch {
    /// Creates an epoch from a raw value.
    #[inline]
    pub const fn new(e: u64) -> Self {
        Self(e)
    }

    /// Returns the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-worker uncoordinated snapshot sequence number.
///
/// Independent and monotonic per worker; carries no cross-worker ordering.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct LocalSeq(pub u64);

impl LocalSeq {
    /// Creates a sequence number from a raw value.
    #[inline]
    pub const fn new(s: u64) -> Self {
        Self(s)
    }

    /// Returns the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LocalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The logical point a snapshot belongs to: a coordinated barrier epoch or a
/// worker-local sequence number.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum SnapshotPoint {
    /// Coordinated snapshot taken at a global barrier epoch.
    Epoch(Epoch),
    /// Uncoordinated snapshot taken on the worker's own timer.
    Local(LocalSeq),
}

impl SnapshotPoint {
    /// Returns the storage key for this point and worker.
    pub fn storage_key(&self, worker: WorkerId) -> String {
        match self {
            SnapshotPoint::Epoch(e) => coordinated_key(*e, worker),
            SnapshotPoint::Local(s) => uncoordinated_key(worker, *s),
        }
    }
}

/// Key for a coordinated snapshot: `coordinated/{epoch}/{worker}.bin`.
pub fn coordinated_key(epoch: Epoch, worker: WorkerId) -> String {
    format!("coordinated/{:010}/{}.bin", epoch.as_u64(), worker)
}

/// Key prefix covering all workers' snapshots for one epoch.
pub fn coordinated_epoch_prefix(epoch: Epoch) -> String {
    format!("coordinated/{:010}/", epoch.as_u64())
}

/// Key for an uncoordinated snapshot: `uncoordinated/{worker}/{seq}.bin`.
pub fn uncoordinated_key(worker: WorkerId, seq: LocalSeq) -> String {
    format!("uncoordinated/{}/{:010}.bin", worker, seq.as_u64())
}

/// Key prefix covering one worker's uncoordinated snapshots.
pub fn uncoordinated_prefix(worker: WorkerId) -> String {
    format!("uncoordinated/{}/", worker)
}

/// Parses the sequence number out of an uncoordinated snapshot key.
///
/// Returns `None` for keys that do not end in a numeric `{seq}.bin` component.
pub fn seq_from_key(key: &str) -> Option<LocalSeq> {
    let name = key.rsplit('/').next()?;
    let digits = name.strip_suffix(".bin")?;
    digits.parse::<u64>().ok().map(LocalSeq::new)
}

/// Metadata for one durable snapshot generation. Immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Worker that owns the snapshotted partition state.
    pub worker_id: WorkerId,
    /// Epoch or local sequence the snapshot belongs to.
    pub point: SnapshotPoint,
    /// When the durable write was acknowledged.
    pub created_at: DateTime<Utc>,
    /// Key of the stored object.
    pub storage_key: String,
    /// Size of the serialized state image in bytes.
    pub size_bytes: u64,
    /// SHA-256 hex digest of the serialized state image.
    pub checksum: String,
    /// First event-log offset not yet reflected in the image; replay resumes
    /// here.
    pub log_offset: u64,
}

/// The object actually written to the store: the record metadata plus the
/// serialized state image. Self-describing so that uncoordinated recovery can
/// find a worker's replay offset without any global manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    /// Record metadata for this generation.
    pub record: SnapshotRecord,
    /// Base64-encoded serialized state image.
    state: String,
}

impl SnapshotEnvelope {
    /// Wraps a record and its serialized state image.
    pub fn new(record: SnapshotRecord, state: &[u8]) -> Self {
        Self {
            record,
            state: BASE64.encode(state),
        }
    }

    /// Decodes the serialized state image.
    pub fn state(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.state)
    }
}

/// SHA-256 hex digest of a serialized state image.
pub fn checksum(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_matches_creation_order() {
        let w = WorkerId::new(3);
        let mut keys: Vec<String> = [1u64, 2, 9, 10, 11, 100]
            .iter()
            .map(|s| uncoordinated_key(w, LocalSeq::new(*s)))
            .collect();
        let created_order = keys.clone();
        keys.sort();
        assert_eq!(keys, created_order);
    }

    #[test]
    fn seq_round_trips_through_key() {
        let key = uncoordinated_key(WorkerId::new(7), LocalSeq::new(42));
        assert_eq!(seq_from_key(&key), Some(LocalSeq::new(42)));
        assert_eq!(seq_from_key("uncoordinated/7/"), None);
        assert_eq!(seq_from_key("manifest/0000000001.json"), None);
    }

    #[test]
    fn coordinated_keys_group_by_epoch() {
        let key = coordinated_key(Epoch::new(8), WorkerId::new(1));
        assert!(key.starts_with(&coordinated_epoch_prefix(Epoch::new(8))));
        assert_eq!(key, "coordinated/0000000008/1.bin");
    }

    #[test]
    fn checksum_is_stable_hex() {
        let a = checksum(b"state");
        let b = checksum(b"state");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, checksum(b"other"));
    }

    #[test]
    fn envelope_round_trips_state() {
        let record = SnapshotRecord {
            worker_id: WorkerId::new(1),
            point: SnapshotPoint::Local(LocalSeq::new(0)),
            created_at: Utc::now(),
            storage_key: uncoordinated_key(WorkerId::new(1), LocalSeq::new(0)),
            size_bytes: 5,
            checksum: checksum(b"state"),
            log_offset: 12,
        };
        let envelope = SnapshotEnvelope::new(record.clone(), b"state");
        let json = serde_json::to_vec(&envelope).unwrap();
        let parsed: SnapshotEnvelope = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed.record, record);
        assert_eq!(parsed.state().unwrap(), b"state");
    }
}
