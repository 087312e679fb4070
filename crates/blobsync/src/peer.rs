//! # Peer Sync
//!
//! Replication between the local store and ONE remote peer.
//!
//! ## Operations
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            PeerSync                                     │
//! │                                                                         │
//! │  download_blob(key)                                                    │
//! │    remote.get ──found──► local.set ──► watermark = now ──► true         │
//! │        │                                                                │
//! │        └─missing──► wait 1s, 2s, 4s, 8s (cap 10s) ──► retry            │
//! │                     5 attempts (1 for read-only remotes) ──► false      │
//! │                                                                         │
//! │  upload_blob(record)                      (no-op for read-only)         │
//! │    watermark = NULL ──► remote.set ──► watermark = now                  │
//! │        │                                                                │
//! │        ├─OverCapacity──► peer flagged, bulk uploads pause               │
//! │        ├─OverSize──────► blob flagged, bulk uploads skip it             │
//! │        └─other─────────► error message recorded                        │
//! │                                                                         │
//! │  full_upload()   local blobs without watermark ──► remote               │
//! │  full_download() remote keys missing locally  ──► local                │
//! │  full_upload_loop() full_upload every 15s until cancelled               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Concurrent `download_blob`/`upload_blob` calls for the same key share one
//! in-flight operation. The operation runs in its own task under the first
//! caller's cancellation token; any caller may stop waiting early with its
//! own token.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use blobsync_core::{BlobRecord, StorageError};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DownloadSettings, SyncConfig, UploadSettings};
use crate::error::{Cancelled, SyncError, SyncResult};
use crate::singleflight::{Flight, SingleFlight};
use crate::status::PeerSyncStatus;
use crate::storage::{BlobStorage, SyncMetadataStore};

// =============================================================================
// Settings
// =============================================================================

/// Per-peer tunables, usually taken from [`SyncConfig`].
#[derive(Debug, Clone, Default)]
pub struct PeerSettings {
    pub download: DownloadSettings,
    pub upload: UploadSettings,
}

impl From<&SyncConfig> for PeerSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            download: config.download.clone(),
            upload: config.upload.clone(),
        }
    }
}

// =============================================================================
// PeerSync
// =============================================================================

struct PeerInner {
    peer_id: String,
    local: Arc<dyn BlobStorage>,
    remote: Arc<dyn BlobStorage>,
    metadata: Arc<dyn SyncMetadataStore>,
    status: Arc<PeerSyncStatus>,
    downloads: SingleFlight<Result<bool, Cancelled>>,
    uploads: SingleFlight<Result<(), Cancelled>>,
    settings: PeerSettings,
}

/// Replication engine for one remote peer. Cheap to clone.
#[derive(Clone)]
pub struct PeerSync {
    inner: Arc<PeerInner>,
}

impl std::fmt::Debug for PeerSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSync")
            .field("peer_id", &self.inner.peer_id)
            .field("readonly", &self.is_readonly())
            .finish()
    }
}

impl PeerSync {
    /// Creates the engine for one peer.
    ///
    /// ## Arguments
    /// * `peer_id` - Stable identifier; keys the upload watermark
    /// * `local` - The local store
    /// * `remote` - The peer's store
    /// * `metadata` - Watermark store
    /// * `settings` - Retry and loop tunables
    pub fn new(
        peer_id: impl Into<String>,
        local: Arc<dyn BlobStorage>,
        remote: Arc<dyn BlobStorage>,
        metadata: Arc<dyn SyncMetadataStore>,
        settings: PeerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                peer_id: peer_id.into(),
                local,
                remote,
                metadata,
                status: Arc::new(PeerSyncStatus::new()),
                downloads: SingleFlight::new(),
                uploads: SingleFlight::new(),
                settings,
            }),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// True if the remote is read-only.
    pub fn is_readonly(&self) -> bool {
        self.inner.remote.is_readonly()
    }

    pub fn status(&self) -> &Arc<PeerSyncStatus> {
        &self.inner.status
    }

    pub fn remote(&self) -> &Arc<dyn BlobStorage> {
        &self.inner.remote
    }

    // =========================================================================
    // Single Blob Download
    // =========================================================================

    /// Pulls one blob from the peer into the local store.
    ///
    /// ## Returns
    /// * `Ok(true)` - the blob was found and stored locally
    /// * `Ok(false)` - not found after every attempt, or the transfer failed
    ///   (the failure is recorded in [`status`](Self::status))
    /// * `Err(SyncError::Cancelled)` - `cancel` fired
    pub async fn download_blob(&self, key: &str, cancel: &CancellationToken) -> SyncResult<bool> {
        let this = self.clone();
        let owned_key = key.to_string();
        let token = cancel.clone();

        let flight = self
            .inner
            .downloads
            .run(key, move || async move { this.download_task(owned_key, token).await });

        match self.join(flight, cancel).await {
            Err(SyncError::TaskFailed(reason)) => {
                error!(peer = %self.peer_id(), key = %key, error = %reason, "Download task failed");
                Ok(false)
            }
            outcome => outcome,
        }
    }

    async fn download_task(self, key: String, cancel: CancellationToken) -> Result<bool, Cancelled> {
        let status = &self.inner.status;
        status.blob_downloading(&key);

        let outcome = match self.pull(&key, &cancel).await {
            Ok(found) => Ok(found),
            Err(SyncError::Cancelled) => {
                debug!(peer = %self.peer_id(), key = %key, "Blob download cancelled");
                Err(Cancelled)
            }
            Err(err) => {
                warn!(peer = %self.peer_id(), key = %key, error = %err, "Blob download failed");
                status.blob_error(&key, err.to_string());
                Ok(false)
            }
        };

        status.blob_download_finish(&key);
        outcome
    }

    async fn pull(&self, key: &str, cancel: &CancellationToken) -> SyncResult<bool> {
        let attempts = self.inner.settings.download.attempts_for(self.is_readonly());
        let mut backoff = self.download_backoff();

        for attempt in 1..=attempts {
            ensure_active(cancel)?;
            let fetched = self.inner.remote.get(key, cancel).await?;
            ensure_active(cancel)?;

            if let Some(record) = fetched {
                self.inner.local.set(&record, cancel).await?;
                self.inner
                    .metadata
                    .set_blob_uploaded_at(self.peer_id(), key, Some(Utc::now()))
                    .await?;
                self.inner.status.blob_error_free(key);

                debug!(peer = %self.peer_id(), key = %key, attempt, "Blob downloaded");
                return Ok(true);
            }

            if attempt < attempts {
                let delay = next_delay(&mut backoff, self.inner.settings.download.max_backoff());
                debug!(
                    peer = %self.peer_id(),
                    key = %key,
                    attempt,
                    ?delay,
                    "Blob not found on peer, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                }
            }
        }

        debug!(peer = %self.peer_id(), key = %key, attempts, "Blob not found on peer");
        Ok(false)
    }

    /// Exponential backoff without jitter.
    fn download_backoff(&self) -> ExponentialBackoff {
        let download = &self.inner.settings.download;
        ExponentialBackoff {
            current_interval: download.initial_backoff(),
            initial_interval: download.initial_backoff(),
            max_interval: download.max_backoff(),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    // =========================================================================
    // Single Blob Upload
    // =========================================================================

    /// Pushes one blob to the peer.
    ///
    /// Failures are recorded in [`status`](Self::status), never returned;
    /// the only error is `SyncError::Cancelled`. No-op for read-only peers.
    pub async fn upload_blob(&self, record: BlobRecord, cancel: &CancellationToken) -> SyncResult<()> {
        if self.is_readonly() {
            return Ok(());
        }

        let this = self.clone();
        let key = record.key.clone();
        let token = cancel.clone();

        let flight = self
            .inner
            .uploads
            .run(&key, move || async move { this.upload_task(record, token).await });

        match self.join(flight, cancel).await {
            Err(SyncError::TaskFailed(reason)) => {
                error!(peer = %self.peer_id(), key = %key, error = %reason, "Upload task failed");
                Ok(())
            }
            outcome => outcome,
        }
    }

    async fn upload_task(self, record: BlobRecord, cancel: CancellationToken) -> Result<(), Cancelled> {
        let key = record.key.as_str();
        let status = &self.inner.status;
        status.blob_uploading(key);

        let outcome = match self.push(&record, &cancel).await {
            Ok(()) => Ok(()),
            Err(SyncError::Cancelled) => {
                debug!(peer = %self.peer_id(), key = %key, "Blob upload cancelled");
                Err(Cancelled)
            }
            Err(err) => {
                self.record_upload_failure(key, &err);
                Ok(())
            }
        };

        status.blob_upload_finish(key);
        outcome
    }

    async fn push(&self, record: &BlobRecord, cancel: &CancellationToken) -> SyncResult<()> {
        let key = record.key.as_str();
        let metadata = &self.inner.metadata;

        metadata.set_blob_uploaded_at(self.peer_id(), key, None).await?;
        ensure_active(cancel)?;

        self.inner.remote.set(record, cancel).await?;
        metadata
            .set_blob_uploaded_at(self.peer_id(), key, Some(Utc::now()))
            .await?;

        self.inner.status.remote_over_capacity_free();
        self.inner.status.blob_error_free(key);

        debug!(peer = %self.peer_id(), key = %key, size = record.size(), "Blob uploaded");
        Ok(())
    }

    fn record_upload_failure(&self, key: &str, err: &SyncError) {
        let status = &self.inner.status;

        match err.storage_error() {
            Some(StorageError::OverCapacity) => {
                warn!(peer = %self.peer_id(), key = %key, "Remote storage over capacity");
                status.remote_over_capacity();
            }
            Some(StorageError::OverSize) => {
                warn!(peer = %self.peer_id(), key = %key, "Remote refused blob size");
                status.blob_over_size(key);
            }
            _ => {
                warn!(peer = %self.peer_id(), key = %key, error = %err, "Blob upload failed");
            }
        }

        status.blob_error(key, err.to_string());
    }

    /// Records that `key` is present on the peer without sending it.
    pub async fn mark_blob_uploaded(&self, key: &str) -> SyncResult<()> {
        self.inner
            .metadata
            .set_blob_uploaded_at(self.peer_id(), key, Some(Utc::now()))
            .await?;
        Ok(())
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Uploads every local blob the peer is not known to have.
    ///
    /// ## Pass Structure
    /// 1. Skip entirely for read-only or over-capacity peers
    /// 2. Wait until both stores are connected
    /// 3. Select local blobs whose watermark is missing or NULL
    /// 4. Small batches upload directly; larger ones first list the remote,
    ///    mark blobs it already has as uploaded, and skip over-size blobs
    pub async fn full_upload(&self, cancel: &CancellationToken) -> SyncResult<()> {
        if self.is_readonly() {
            return Ok(());
        }

        self.wait_connected(cancel).await?;

        let status = &self.inner.status;
        if status.is_over_capacity() {
            debug!(peer = %self.peer_id(), "Remote over capacity, skipping upload pass");
            return Ok(());
        }

        let mut pending = Vec::new();
        for blob in self.inner.local.list(None).await? {
            ensure_active(cancel)?;
            match self
                .inner
                .metadata
                .get_blob_uploaded_at(self.peer_id(), &blob.key)
                .await?
            {
                Some(_) => status.blob_error_free(&blob.key),
                None => pending.push(blob.key),
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        let marks = status.mark_will_upload(pending);
        let total = marks.keys().len();

        if total <= self.inner.settings.upload.direct_upload_threshold {
            debug!(peer = %self.peer_id(), total, "Uploading small batch directly");
            for key in marks.keys() {
                ensure_active(cancel)?;
                self.upload_from_local(key, cancel).await?;
            }
            return Ok(());
        }

        let on_remote: HashSet<String> = self
            .inner
            .remote
            .list(None)
            .await?
            .into_iter()
            .map(|b| b.key)
            .collect();

        let (mut uploaded, mut present, mut skipped) = (0usize, 0usize, 0usize);

        for key in marks.keys() {
            ensure_active(cancel)?;

            if on_remote.contains(key) {
                self.mark_blob_uploaded(key).await?;
                status.blob_upload_finish(key);
                status.blob_error_free(key);
                present += 1;
                continue;
            }

            if status.is_over_size(key) {
                skipped += 1;
                continue;
            }

            if status.is_over_capacity() {
                debug!(peer = %self.peer_id(), "Remote filled up, ending upload pass");
                break;
            }

            self.upload_from_local(key, cancel).await?;
            uploaded += 1;
        }

        info!(
            peer = %self.peer_id(),
            total,
            uploaded,
            already_present = present,
            skipped_over_size = skipped,
            "Upload pass complete"
        );
        Ok(())
    }

    async fn upload_from_local(&self, key: &str, cancel: &CancellationToken) -> SyncResult<()> {
        match self.inner.local.get(key, cancel).await? {
            Some(record) => self.upload_blob(record, cancel).await,
            None => {
                debug!(peer = %self.peer_id(), key = %key, "Blob vanished locally, skipping");
                Ok(())
            }
        }
    }

    /// Downloads every blob the peer has and the local store lacks, one at
    /// a time.
    pub async fn full_download(&self, cancel: &CancellationToken) -> SyncResult<()> {
        self.wait_connected(cancel).await?;

        let local: HashSet<String> = self
            .inner
            .local
            .list(None)
            .await?
            .into_iter()
            .map(|b| b.key)
            .collect();

        let missing: Vec<String> = self
            .inner
            .remote
            .list(None)
            .await?
            .into_iter()
            .map(|b| b.key)
            .filter(|key| !local.contains(key))
            .collect();

        if missing.is_empty() {
            debug!(peer = %self.peer_id(), "Nothing to download");
            return Ok(());
        }

        info!(peer = %self.peer_id(), count = missing.len(), "Downloading missing blobs");

        let marks = self.inner.status.mark_will_download(missing);
        for key in marks.keys() {
            ensure_active(cancel)?;
            self.download_blob(key, cancel).await?;
        }

        Ok(())
    }

    /// Runs [`full_upload`](Self::full_upload) forever, pausing between
    /// passes, until `cancel` fires. Pass failures are logged and retried on
    /// the next pass.
    pub async fn full_upload_loop(&self, cancel: CancellationToken) {
        let interval = self.inner.settings.upload.loop_interval();
        info!(peer = %self.peer_id(), ?interval, "Upload loop started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.full_upload(&cancel).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    warn!(peer = %self.peer_id(), error = %e, ?interval, "Upload pass failed, will retry");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!(peer = %self.peer_id(), "Upload loop stopped");
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn wait_connected(&self, cancel: &CancellationToken) -> SyncResult<()> {
        self.inner.local.connection().wait_for_connected(cancel).await?;
        self.inner.remote.connection().wait_for_connected(cancel).await?;
        Ok(())
    }

    /// Waits for a shared flight, letting this caller give up early.
    ///
    /// A flight whose task died yields `SyncError::TaskFailed`.
    async fn join<T: Clone>(
        &self,
        flight: Flight<Result<T, Cancelled>>,
        cancel: &CancellationToken,
    ) -> SyncResult<T> {
        let settled = tokio::select! {
            settled = flight => settled?,
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        };

        Ok(settled?)
    }
}

fn ensure_active(cancel: &CancellationToken) -> SyncResult<()> {
    if cancel.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

/// Next retry delay, in whole milliseconds.
fn next_delay(backoff: &mut ExponentialBackoff, max: Duration) -> Duration {
    let delay = backoff.next_backoff().unwrap_or(max);
    Duration::from_millis(delay.as_millis() as u64).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHandle, ConnectionState};
    use crate::storage::{MemoryBlobStorage, MemorySyncMetadata};
    use crate::test_util::init_tracing;
    use futures_util::future::join_all;
    use tokio::time::Instant;

    struct Fixture {
        peer: PeerSync,
        local: Arc<MemoryBlobStorage>,
        remote: Arc<MemoryBlobStorage>,
        metadata: Arc<MemorySyncMetadata>,
    }

    fn fixture(remote: MemoryBlobStorage) -> Fixture {
        init_tracing();
        let local = Arc::new(MemoryBlobStorage::new());
        let remote = Arc::new(remote);
        let metadata = Arc::new(MemorySyncMetadata::new());
        let peer = PeerSync::new(
            "cloud",
            local.clone(),
            remote.clone(),
            metadata.clone(),
            PeerSettings::default(),
        );
        Fixture {
            peer,
            local,
            remote,
            metadata,
        }
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    async fn watermark(f: &Fixture, key: &str) -> Option<chrono::DateTime<Utc>> {
        f.metadata.get_blob_uploaded_at("cloud", key).await.unwrap()
    }

    // =========================================================================
    // download_blob
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_downloads_hit_remote_once() {
        let f = fixture(MemoryBlobStorage::new().with_latency(Duration::from_millis(100)));
        f.remote.insert(BlobRecord::new("a", "payload"));

        let cancel = token();
        let results = join_all((0..5).map(|_| f.peer.download_blob("a", &cancel))).await;

        for result in results {
            assert!(result.unwrap());
        }
        assert_eq!(f.remote.get_calls(), 1);
        assert!(f.local.contains("a"));
        assert!(watermark(&f, "a").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_blob_gives_up_after_five_attempts() {
        let f = fixture(MemoryBlobStorage::new());
        let start = Instant::now();

        let found = f.peer.download_blob("ghost", &token()).await.unwrap();

        assert!(!found);
        assert_eq!(f.remote.get_calls(), 5);
        // 1s + 2s + 4s + 8s
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(15), "waited {waited:?}");
        assert!(waited < Duration::from_secs(16), "waited {waited:?}");

        // Not found is not an error
        assert_eq!(f.peer.status().blob_state("ghost").error_message, None);
        assert_eq!(f.peer.status().snapshot().downloading, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readonly_remote_gets_single_attempt() {
        let f = fixture(MemoryBlobStorage::new().readonly());
        let start = Instant::now();

        assert!(!f.peer.download_blob("ghost", &token()).await.unwrap());
        assert_eq!(f.remote.get_calls(), 1);
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blob_appearing_during_backoff_is_found() {
        let f = fixture(MemoryBlobStorage::new());

        let remote = f.remote.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            remote.insert(BlobRecord::new("late", "x"));
        });

        assert!(f.peer.download_blob("late", &token()).await.unwrap());
        // Attempts at 0s, 1s, 3s
        assert_eq!(f.remote.get_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_is_prompt() {
        let f = fixture(MemoryBlobStorage::new());
        let cancel = token();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = f.peer.download_blob("ghost", &cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(f.remote.get_calls(), 2);

        // Let the flight task finish its bookkeeping
        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = f.peer.status().blob_state("ghost");
        assert!(!state.downloading);
        assert_eq!(state.error_message, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_error_is_recorded_and_cleared_by_success() {
        let f = fixture(MemoryBlobStorage::new());
        f.remote.fail_next_get(StorageError::backend("connection reset"));

        assert!(!f.peer.download_blob("a", &token()).await.unwrap());
        assert_eq!(f.remote.get_calls(), 1);
        assert_eq!(
            f.peer.status().blob_state("a").error_message.as_deref(),
            Some("connection reset")
        );
        assert_eq!(f.peer.status().snapshot().error, 1);

        f.remote.insert(BlobRecord::new("a", "x"));
        assert!(f.peer.download_blob("a", &token()).await.unwrap());
        assert_eq!(f.peer.status().blob_state("a").error_message, None);
    }

    // =========================================================================
    // upload_blob
    // =========================================================================

    #[tokio::test]
    async fn test_upload_sets_watermark() {
        let f = fixture(MemoryBlobStorage::new());

        f.peer
            .upload_blob(BlobRecord::new("a", "x"), &token())
            .await
            .unwrap();

        assert!(f.remote.contains("a"));
        assert!(watermark(&f, "a").await.is_some());
        assert_eq!(f.peer.status().snapshot(), Default::default());
    }

    #[tokio::test]
    async fn test_readonly_upload_is_noop() {
        let f = fixture(MemoryBlobStorage::new().readonly());

        f.peer
            .upload_blob(BlobRecord::new("a", "x"), &token())
            .await
            .unwrap();
        f.peer.full_upload(&token()).await.unwrap();

        assert_eq!(f.remote.set_calls(), 0);
        assert_eq!(watermark(&f, "a").await, None);
    }

    #[tokio::test]
    async fn test_over_capacity_pauses_bulk_until_an_upload_succeeds() {
        let f = fixture(MemoryBlobStorage::new().with_capacity(4));

        f.peer
            .upload_blob(BlobRecord::new("a", vec![0u8; 10]), &token())
            .await
            .unwrap();

        let status = f.peer.status();
        assert!(status.is_over_capacity());
        assert_eq!(
            status.blob_state("a").error_message.as_deref(),
            Some("Remote storage over capacity")
        );
        assert_eq!(watermark(&f, "a").await, None);

        // Bulk pass is skipped while over capacity
        f.local.insert(BlobRecord::new("b", "y"));
        f.peer.full_upload(&token()).await.unwrap();
        assert_eq!(f.remote.set_calls(), 1);

        // Space frees up; the next direct upload clears the flag
        f.remote.set_capacity(None);
        f.peer
            .upload_blob(BlobRecord::new("a", vec![0u8; 10]), &token())
            .await
            .unwrap();
        assert!(!status.is_over_capacity());
        assert_eq!(status.blob_state("a").error_message, None);

        f.peer.full_upload(&token()).await.unwrap();
        assert!(f.remote.contains("b"));
    }

    #[tokio::test]
    async fn test_generic_upload_failure_keeps_watermark_cleared() {
        let f = fixture(MemoryBlobStorage::new());
        f.metadata
            .set_blob_uploaded_at("cloud", "a", Some(Utc::now()))
            .await
            .unwrap();
        f.remote.fail_next_set(StorageError::backend("503 Service Unavailable"));

        f.peer
            .upload_blob(BlobRecord::new("a", "x"), &token())
            .await
            .unwrap();

        let state = f.peer.status().blob_state("a");
        assert!(!state.uploading);
        assert!(!state.over_size);
        assert_eq!(state.error_message.as_deref(), Some("503 Service Unavailable"));
        assert_eq!(watermark(&f, "a").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_upload_is_not_an_error() {
        let f = fixture(MemoryBlobStorage::new().with_latency(Duration::from_secs(10)));
        let cancel = token();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = f
            .peer
            .upload_blob(BlobRecord::new("a", "x"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.peer.status().blob_state("a"), Default::default());
        assert!(!f.remote.contains("a"));
        assert_eq!(watermark(&f, "a").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_uploads_hit_remote_once() {
        let f = fixture(MemoryBlobStorage::new().with_latency(Duration::from_millis(100)));

        let cancel = token();
        let results = join_all(
            (0..5).map(|_| f.peer.upload_blob(BlobRecord::new("a", "payload"), &cancel)),
        )
        .await;

        for result in results {
            result.unwrap();
        }
        assert_eq!(f.remote.set_calls(), 1);
        assert!(f.remote.contains("a"));
        assert!(watermark(&f, "a").await.is_some());
        assert_eq!(f.peer.status().snapshot().uploading, 0);
    }

    #[tokio::test]
    async fn test_mark_blob_uploaded() {
        let f = fixture(MemoryBlobStorage::new());
        f.peer.mark_blob_uploaded("a").await.unwrap();
        assert!(watermark(&f, "a").await.is_some());
        assert_eq!(f.remote.set_calls(), 0);
    }

    // =========================================================================
    // full_upload
    // =========================================================================

    #[tokio::test]
    async fn test_small_batch_uploads_without_listing_remote() {
        let f = fixture(MemoryBlobStorage::new());
        f.local.insert(BlobRecord::new("a", "1"));
        f.local.insert(BlobRecord::new("b", "2"));

        f.peer.full_upload(&token()).await.unwrap();

        assert_eq!(f.remote.list_calls(), 0);
        assert_eq!(f.remote.set_calls(), 2);
        assert_eq!(f.remote.keys(), vec!["a", "b"]);
        assert_eq!(f.peer.status().snapshot().uploading, 0);
    }

    #[tokio::test]
    async fn test_watermarked_blobs_are_skipped_and_errors_cleared() {
        let f = fixture(MemoryBlobStorage::new());
        f.local.insert(BlobRecord::new("a", "1"));
        f.peer.mark_blob_uploaded("a").await.unwrap();
        f.peer.status().blob_error("a", "stale failure");

        f.peer.full_upload(&token()).await.unwrap();

        assert_eq!(f.remote.set_calls(), 0);
        assert_eq!(f.peer.status().blob_state("a").error_message, None);
    }

    #[tokio::test]
    async fn test_bulk_pass_short_circuits_blobs_already_on_remote() {
        let f = fixture(MemoryBlobStorage::new());
        for key in ["a", "b", "c", "d", "e"] {
            f.local.insert(BlobRecord::new(key, "x"));
        }
        for key in ["a", "c", "e"] {
            f.remote.insert(BlobRecord::new(key, "x"));
        }

        f.peer.full_upload(&token()).await.unwrap();

        assert_eq!(f.remote.list_calls(), 1);
        assert_eq!(f.remote.set_calls(), 2);
        for key in ["a", "b", "c", "d", "e"] {
            assert!(watermark(&f, key).await.is_some(), "{key} not marked");
        }
        assert_eq!(f.peer.status().snapshot(), Default::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_pass_marks_every_pending_blob_up_front() {
        let f = fixture(MemoryBlobStorage::new().with_latency(Duration::from_secs(10)));
        for key in ["a", "b", "c", "d", "e"] {
            f.local.insert(BlobRecord::new(key, "x"));
        }

        let peer = f.peer.clone();
        let pass = tokio::spawn(async move { peer.full_upload(&CancellationToken::new()).await });

        // First upload is still in the remote's latency window
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.remote.set_calls(), 1);
        assert!(f.remote.keys().is_empty());
        assert_eq!(f.peer.status().snapshot().uploading, 5);
        assert!(f.peer.status().blob_state("e").uploading);

        pass.await.unwrap().unwrap();
        assert_eq!(f.remote.set_calls(), 5);
        assert_eq!(f.peer.status().snapshot().uploading, 0);
    }

    #[tokio::test]
    async fn test_bulk_pass_skips_over_size_blobs() {
        let f = fixture(MemoryBlobStorage::new().with_max_blob_size(4));
        f.local.insert(BlobRecord::new("big", vec![0u8; 64]));
        for key in ["a", "b", "c", "d"] {
            f.local.insert(BlobRecord::new(key, "x"));
        }

        f.peer.full_upload(&token()).await.unwrap();
        assert_eq!(f.remote.set_calls(), 5);

        let status = f.peer.status();
        assert!(status.is_over_size("big"));
        assert_eq!(
            status.blob_state("big").error_message.as_deref(),
            Some("Blob size too large")
        );

        for key in ["e", "f", "g"] {
            f.local.insert(BlobRecord::new(key, "x"));
        }
        f.peer.full_upload(&token()).await.unwrap();

        // Only e, f, g were sent; "big" stays flagged
        assert_eq!(f.remote.set_calls(), 8);
        assert!(status.is_over_size("big"));
        assert_eq!(status.snapshot().error, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_upload_waits_for_connection() {
        let connection = ConnectionHandle::new(ConnectionState::Connecting);
        let f = fixture(MemoryBlobStorage::new().with_connection(connection.clone()));
        f.local.insert(BlobRecord::new("a", "x"));

        let peer = f.peer.clone();
        let pass = tokio::spawn(async move { peer.full_upload(&CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.remote.set_calls(), 0);

        connection.set_state(ConnectionState::Connected);
        pass.await.unwrap().unwrap();
        assert!(f.remote.contains("a"));
    }

    // =========================================================================
    // full_download
    // =========================================================================

    #[tokio::test]
    async fn test_full_download_fetches_only_missing() {
        let f = fixture(MemoryBlobStorage::new());
        for key in ["A", "B", "C"] {
            f.local.insert(BlobRecord::new(key, "local"));
        }
        for key in ["B", "C", "D"] {
            f.remote.insert(BlobRecord::new(key, "remote"));
        }

        f.peer.full_download(&token()).await.unwrap();

        assert_eq!(f.remote.get_calls(), 1);
        assert_eq!(f.local.keys(), vec!["A", "B", "C", "D"]);
        assert_eq!(f.peer.status().snapshot().downloading, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_download_cancellation_clears_marks() {
        let f = fixture(MemoryBlobStorage::new().with_latency(Duration::from_secs(5)));
        for key in ["a", "b", "c"] {
            f.remote.insert(BlobRecord::new(key, "x"));
        }
        let cancel = token();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let err = f.peer.full_download(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.local.keys(), vec!["a"]);
        assert_eq!(f.peer.status().snapshot().downloading, 0);
    }

    // =========================================================================
    // full_upload_loop
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_upload_loop_repeats_until_cancelled() {
        let f = fixture(MemoryBlobStorage::new());
        f.local.insert(BlobRecord::new("a", "x"));
        let cancel = token();

        let peer = f.peer.clone();
        let looped = cancel.clone();
        let task = tokio::spawn(async move { peer.full_upload_loop(looped).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(f.remote.contains("a"));

        f.local.insert(BlobRecord::new("b", "y"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!f.remote.contains("b"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(f.remote.contains("b"));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_loop_survives_failed_pass() {
        let f = fixture(MemoryBlobStorage::new());
        f.local.insert(BlobRecord::new("a", "x"));
        let cancel = token();

        // First pass: the direct upload fails and is recorded, loop carries on
        f.remote.fail_next_set(StorageError::backend("flaky"));

        let peer = f.peer.clone();
        let looped = cancel.clone();
        let task = tokio::spawn(async move { peer.full_upload_loop(looped).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!f.remote.contains("a"));
        assert_eq!(f.peer.status().snapshot().error, 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(f.remote.contains("a"));
        assert_eq!(f.peer.status().snapshot().error, 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
