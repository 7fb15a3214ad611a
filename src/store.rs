//! Snapshot store client: the durable blob-storage contract.
//!
//! Writes are atomic from the caller's perspective; no partial write is ever
//! visible via `get` or `list`. Keys are unique per generation and history is
//! never overwritten. [`InMemorySnapshotStore`] backs tests and
//! single-process deployments; [`FileSnapshotStore`] persists to a local
//! directory using a tmp-file-then-rename protocol. Remote backends implement
//! the same trait against the connection parameters in
//! [`BlobStoreConfig`](crate::config::BlobStoreConfig).

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

/// Error type for snapshot store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O or filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// No object exists under the requested key.
    #[error("object not found: {0}")]
    NotFound(String),
    /// Backend rejected the request or is unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Contract for durable snapshot blob storage.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Atomically stores `bytes` under `key`. Once `put` returns `Ok`, the
    /// object is durable and visible; before that, nothing is visible.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Returns the bytes stored under `key`, or [`StoreError::NotFound`].
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Returns all keys under `prefix` in lexicographic order. With the
    /// zero-padded key scheme of [`crate::record`], this is creation order
    /// for a single worker's keys.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Removes the object under `key`. Deleting an absent key is not an
    /// error, so retried deletions are idempotent.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory snapshot store for tests and single-process use.
pub struct InMemorySnapshotStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl Default for InMemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySnapshotStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    /// Returns true if the store holds no objects.
    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().await;
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let objects = self.objects.lock().await;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.lock().await;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().await;
        objects.remove(key);
        Ok(())
    }
}

/// File-backed snapshot store.
///
/// Each key maps to `<base>/<key>`; `put` writes to a `.tmp` sibling and
/// renames it into place so readers never observe a partial object. `.tmp`
/// files are invisible to `get` and `list`.
pub struct FileSnapshotStore {
    base: PathBuf,
}

impl FileSnapshotStore {
    /// Creates a store rooted at the given directory.
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.base.join(key)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(self.object_path(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.extension().map_or(false, |e| e == "tmp") {
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(&self.base) {
                    let key = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.object_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{uncoordinated_key, LocalSeq, WorkerId};
    use tempfile::TempDir;

    #[tokio::test]
    async fn in_memory_round_trip_is_byte_identical() {
        let store = InMemorySnapshotStore::new();
        let payload = vec![0u8, 1, 2, 255, 254];
        store.put("coordinated/0000000001/0.bin", &payload).await.unwrap();
        let read = store.get("coordinated/0000000001/0.bin").await.unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn in_memory_get_missing_is_not_found() {
        let store = InMemorySnapshotStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn in_memory_list_returns_single_worker_keys_in_creation_order() {
        let store = InMemorySnapshotStore::new();
        let w = WorkerId::new(4);
        for seq in [0u64, 1, 2, 9, 10, 11] {
            store
                .put(&uncoordinated_key(w, LocalSeq::new(seq)), b"s")
                .await
                .unwrap();
        }
        // Another worker's keys must not leak into the listing.
        store
            .put(&uncoordinated_key(WorkerId::new(5), LocalSeq::new(0)), b"s")
            .await
            .unwrap();

        let keys = store
            .list(&crate::record::uncoordinated_prefix(w))
            .await
            .unwrap();
        let expected: Vec<String> = [0u64, 1, 2, 9, 10, 11]
            .iter()
            .map(|s| uncoordinated_key(w, LocalSeq::new(*s)))
            .collect();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn in_memory_delete_is_idempotent() {
        let store = InMemorySnapshotStore::new();
        store.put("k", b"v").await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn file_store_round_trip_and_list() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(tmp.path());
        let w = WorkerId::new(2);
        let payload = b"\x00\x01binary\xff".to_vec();
        for seq in [1u64, 2, 10] {
            store
                .put(&uncoordinated_key(w, LocalSeq::new(seq)), &payload)
                .await
                .unwrap();
        }
        let read = store
            .get(&uncoordinated_key(w, LocalSeq::new(10)))
            .await
            .unwrap();
        assert_eq!(read, payload);

        let keys = store
            .list(&crate::record::uncoordinated_prefix(w))
            .await
            .unwrap();
        let expected: Vec<String> = [1u64, 2, 10]
            .iter()
            .map(|s| uncoordinated_key(w, LocalSeq::new(*s)))
            .collect();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn file_store_hides_tmp_files_from_listing() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(tmp.path());
        store.put("uncoordinated/1/0000000000.bin", b"x").await.unwrap();
        // A crashed writer leaves a .tmp behind; it must stay invisible.
        std::fs::write(tmp.path().join("uncoordinated/1/0000000001.tmp"), b"partial").unwrap();

        let keys = store.list("uncoordinated/1/").await.unwrap();
        assert_eq!(keys, vec!["uncoordinated/1/0000000000.bin".to_string()]);
        let err = store.get("uncoordinated/1/0000000001.bin").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn file_store_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(tmp.path());
        store.put("manifest/0000000001.json", b"{}").await.unwrap();
        store.delete("manifest/0000000001.json").await.unwrap();
        store.delete("manifest/0000000001.json").await.unwrap();
        assert!(store.list("manifest/").await.unwrap().is_empty());
    }
}
