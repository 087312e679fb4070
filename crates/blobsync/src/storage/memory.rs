//! # In-Memory Storage
//!
//! Ephemeral [`BlobStorage`] and [`SyncMetadataStore`] implementations.
//!
//! `MemoryBlobStorage` can also play a constrained remote: a read-only
//! mirror, a quota-limited bucket (`OverCapacity`), a service with a per-blob
//! size cap (`OverSize`), or a slow link (artificial latency). Call counters
//! make it usable as a test double.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use blobsync_core::{BlobRecord, ListedBlob, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{BlobStorage, SyncMetadataStore};
use crate::connection::ConnectionHandle;

// =============================================================================
// MemoryBlobStorage
// =============================================================================

#[derive(Debug)]
struct StoredBlob {
    record: BlobRecord,
    deleted: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    blobs: BTreeMap<String, StoredBlob>,
    capacity: Option<usize>,
    get_failures: VecDeque<StorageError>,
    set_failures: VecDeque<StorageError>,
}

impl MemoryState {
    /// Bytes held, soft-deleted blobs included, ignoring `except`.
    fn used_bytes(&self, except: &str) -> usize {
        self.blobs
            .iter()
            .filter(|(key, _)| key.as_str() != except)
            .map(|(_, b)| b.record.size())
            .sum()
    }
}

/// Blob store backed by a `BTreeMap`.
///
/// ## Example
/// ```rust,ignore
/// let remote = MemoryBlobStorage::new()
///     .with_capacity(10 * 1024 * 1024)
///     .with_max_blob_size(1024 * 1024);
/// ```
#[derive(Debug)]
pub struct MemoryBlobStorage {
    state: Mutex<MemoryState>,
    readonly: bool,
    max_blob_size: Option<usize>,
    latency: Option<Duration>,
    connection: ConnectionHandle,
    get_calls: AtomicUsize,
    set_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

impl Default for MemoryBlobStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStorage {
    /// Creates an empty, writable, connected store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            readonly: false,
            max_blob_size: None,
            latency: None,
            connection: ConnectionHandle::connected(),
            get_calls: AtomicUsize::new(0),
            set_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Marks the store read-only; `set` fails with `Readonly`.
    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Limits the total bytes held; `set` beyond it fails with `OverCapacity`.
    pub fn with_capacity(self, bytes: usize) -> Self {
        self.state.lock().capacity = Some(bytes);
        self
    }

    /// Limits single blobs; larger `set`s fail with `OverSize`.
    pub fn with_max_blob_size(mut self, bytes: usize) -> Self {
        self.max_blob_size = Some(bytes);
        self
    }

    /// Delays every `get` and `set` by `latency` (cancellable).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Uses an externally driven connection handle.
    pub fn with_connection(mut self, connection: ConnectionHandle) -> Self {
        self.connection = connection;
        self
    }

    /// Changes the quota at runtime (`None` removes it).
    pub fn set_capacity(&self, bytes: Option<usize>) {
        self.state.lock().capacity = bytes;
    }

    /// Stores a blob directly, bypassing every limit and the read-only flag.
    pub fn insert(&self, record: BlobRecord) {
        self.state.lock().blobs.insert(
            record.key.clone(),
            StoredBlob {
                record,
                deleted: false,
            },
        );
    }

    /// True if a live blob exists under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.state
            .lock()
            .blobs
            .get(key)
            .is_some_and(|b| !b.deleted)
    }

    /// Keys of all live blobs, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.state
            .lock()
            .blobs
            .iter()
            .filter(|(_, b)| !b.deleted)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Makes the next `get` fail with `err`.
    pub fn fail_next_get(&self, err: StorageError) {
        self.state.lock().get_failures.push_back(err);
    }

    /// Makes the next `set` fail with `err`.
    pub fn fail_next_set(&self, err: StorageError) {
        self.state.lock().set_failures.push_back(err);
    }

    /// Number of `get` calls so far.
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// Number of `set` calls so far.
    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    /// Number of `list` calls so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self, cancel: &CancellationToken) -> StorageResult<()> {
        if let Some(latency) = self.latency {
            tokio::select! {
                _ = tokio::time::sleep(latency) => {}
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            }
        }
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    async fn get(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> StorageResult<Option<BlobRecord>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency(cancel).await?;

        let mut state = self.state.lock();
        if let Some(err) = state.get_failures.pop_front() {
            return Err(err);
        }

        Ok(state
            .blobs
            .get(key)
            .filter(|b| !b.deleted)
            .map(|b| b.record.clone()))
    }

    async fn set(&self, record: &BlobRecord, cancel: &CancellationToken) -> StorageResult<()> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency(cancel).await?;

        if self.readonly {
            return Err(StorageError::Readonly);
        }

        let mut state = self.state.lock();
        if let Some(err) = state.set_failures.pop_front() {
            return Err(err);
        }

        if self.max_blob_size.is_some_and(|max| record.size() > max) {
            return Err(StorageError::OverSize);
        }

        if let Some(capacity) = state.capacity {
            if state.used_bytes(&record.key) + record.size() > capacity {
                return Err(StorageError::OverCapacity);
            }
        }

        state.blobs.insert(
            record.key.clone(),
            StoredBlob {
                record: record.clone(),
                deleted: false,
            },
        );
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> StorageResult<Vec<ListedBlob>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let state = self.state.lock();
        Ok(state
            .blobs
            .values()
            .filter(|b| !b.deleted)
            .filter(|b| prefix.map_or(true, |p| b.record.key.starts_with(p)))
            .map(|b| b.record.listing())
            .collect())
    }

    async fn delete(&self, key: &str, permanently: bool) -> StorageResult<()> {
        if self.readonly {
            return Err(StorageError::Readonly);
        }

        let mut state = self.state.lock();
        if permanently {
            state.blobs.remove(key);
        } else if let Some(blob) = state.blobs.get_mut(key) {
            blob.deleted = true;
        }
        Ok(())
    }

    async fn release(&self) -> StorageResult<()> {
        self.state.lock().blobs.retain(|_, b| !b.deleted);
        Ok(())
    }
}

// =============================================================================
// MemorySyncMetadata
// =============================================================================

/// Upload watermarks kept in a `HashMap`.
#[derive(Debug, Default)]
pub struct MemorySyncMetadata {
    marks: Mutex<HashMap<(String, String), Option<DateTime<Utc>>>>,
}

impl MemorySyncMetadata {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncMetadataStore for MemorySyncMetadata {
    async fn get_blob_uploaded_at(
        &self,
        peer: &str,
        key: &str,
    ) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self
            .marks
            .lock()
            .get(&(peer.to_string(), key.to_string()))
            .copied()
            .flatten())
    }

    async fn set_blob_uploaded_at(
        &self,
        peer: &str,
        key: &str,
        uploaded_at: Option<DateTime<Utc>>,
    ) -> StorageResult<()> {
        self.marks
            .lock()
            .insert((peer.to_string(), key.to_string()), uploaded_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_get_set_list() {
        let store = MemoryBlobStorage::new();
        store.set(&BlobRecord::new("b", "2"), &token()).await.unwrap();
        store.set(&BlobRecord::new("a", "1"), &token()).await.unwrap();
        store.set(&BlobRecord::new("x/c", "3"), &token()).await.unwrap();

        let got = store.get("a", &token()).await.unwrap().unwrap();
        assert_eq!(&got.data[..], b"1");
        assert!(store.get("zzz", &token()).await.unwrap().is_none());

        let keys: Vec<_> = store.list(None).await.unwrap().into_iter().map(|b| b.key).collect();
        assert_eq!(keys, vec!["a", "b", "x/c"]);
        assert_eq!(store.list(Some("x/")).await.unwrap().len(), 1);

        assert_eq!(store.get_calls(), 2);
        assert_eq!(store.set_calls(), 3);
        assert_eq!(store.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_limits() {
        let store = MemoryBlobStorage::new()
            .with_capacity(10)
            .with_max_blob_size(6);

        assert_eq!(
            store.set(&BlobRecord::new("big", vec![0u8; 7]), &token()).await,
            Err(StorageError::OverSize)
        );

        store.set(&BlobRecord::new("a", vec![0u8; 6]), &token()).await.unwrap();
        assert_eq!(
            store.set(&BlobRecord::new("b", vec![0u8; 5]), &token()).await,
            Err(StorageError::OverCapacity)
        );

        // Replacing a key does not double count it
        store.set(&BlobRecord::new("a", vec![0u8; 5]), &token()).await.unwrap();
        store.set(&BlobRecord::new("b", vec![0u8; 5]), &token()).await.unwrap();

        store.set_capacity(None);
        store.set(&BlobRecord::new("c", vec![0u8; 6]), &token()).await.unwrap();
    }

    #[tokio::test]
    async fn test_readonly_and_insert() {
        let store = MemoryBlobStorage::new().readonly();
        assert!(store.is_readonly());
        assert_eq!(
            store.set(&BlobRecord::new("a", "x"), &token()).await,
            Err(StorageError::Readonly)
        );

        store.insert(BlobRecord::new("a", "x"));
        assert!(store.contains("a"));
    }

    #[tokio::test]
    async fn test_soft_delete_and_release() {
        let store = MemoryBlobStorage::new();
        store.insert(BlobRecord::new("a", "x"));
        store.insert(BlobRecord::new("b", "y"));

        store.delete("a", false).await.unwrap();
        assert!(!store.contains("a"));
        assert!(store.get("a", &token()).await.unwrap().is_none());
        assert_eq!(store.keys(), vec!["b"]);

        // Revived by a write
        store.set(&BlobRecord::new("a", "z"), &token()).await.unwrap();
        assert!(store.contains("a"));

        store.delete("a", false).await.unwrap();
        store.release().await.unwrap();
        store.delete("b", true).await.unwrap();
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures_fire_once() {
        let store = MemoryBlobStorage::new();
        store.fail_next_set(StorageError::backend("disk on fire"));
        store.fail_next_get(StorageError::Disconnected);

        assert!(store.set(&BlobRecord::new("a", "x"), &token()).await.is_err());
        store.set(&BlobRecord::new("a", "x"), &token()).await.unwrap();

        assert_eq!(
            store.get("a", &token()).await,
            Err(StorageError::Disconnected)
        );
        assert!(store.get("a", &token()).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_cancellable() {
        let store = MemoryBlobStorage::new().with_latency(Duration::from_secs(60));
        let cancel = token();
        cancel.cancel();

        assert_eq!(
            store.get("a", &cancel).await,
            Err(StorageError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_metadata_roundtrip() {
        let meta = MemorySyncMetadata::new();
        let now = Utc::now();

        assert_eq!(meta.get_blob_uploaded_at("p", "k").await.unwrap(), None);
        meta.set_blob_uploaded_at("p", "k", Some(now)).await.unwrap();
        assert_eq!(meta.get_blob_uploaded_at("p", "k").await.unwrap(), Some(now));
        assert_eq!(meta.get_blob_uploaded_at("q", "k").await.unwrap(), None);
        meta.set_blob_uploaded_at("p", "k", None).await.unwrap();
        assert_eq!(meta.get_blob_uploaded_at("p", "k").await.unwrap(), None);
    }
}
