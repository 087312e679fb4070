//! # Blob Frontend
//!
//! The entry point the rest of the application talks to.
//!
//! ## Request Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  get(key)                                                               │
//! │    lock(key) ──► local.get ──hit──► return                             │
//! │                      │                                                  │
//! │                     miss ──► unlock ──► sync.download_blob(key)         │
//! │                                             │                           │
//! │                              lock(key) ◄────┘ ──► local.get ──► return  │
//! │                                                                         │
//! │  set(record)                                                            │
//! │    size > max ──► notify listeners ──► Err(BlobTooLarge)               │
//! │        │                                                                │
//! │        └──► lock(key) ──► local.set ──► unlock ──► Ok                  │
//! │                                          │                              │
//! │                                          └──► spawn sync.upload_blob    │
//! │                                               (not awaited)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The per-key lock only orders frontend calls against each other. Background
//! reconciliation writes to the local store without it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use blobsync_core::validation::{validate_blob_key, validate_blob_size};
use blobsync_core::{BlobRecord, BlobState, SyncState, DEFAULT_MAX_BLOB_SIZE};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::coordinator::SyncCoordinator;
use crate::error::SyncResult;
use crate::lock::KeyedLock;
use crate::storage::BlobStorage;

/// Identifies a registered max-size listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type SizeListener = Arc<dyn Fn(usize) + Send + Sync>;

/// Caller-facing blob store backed by the local store and replicated by a
/// [`SyncCoordinator`].
pub struct BlobFrontend {
    local: Arc<dyn BlobStorage>,
    sync: SyncCoordinator,
    locks: KeyedLock,
    max_blob_size: AtomicUsize,
    listeners: Mutex<Vec<(ListenerId, SizeListener)>>,
    next_listener: AtomicU64,
    uploads: TaskTracker,
    cancel: CancellationToken,
}

impl std::fmt::Debug for BlobFrontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobFrontend")
            .field("local", &self.local)
            .field("sync", &self.sync)
            .field("max_blob_size", &self.max_blob_size())
            .field("pending_uploads", &self.uploads.len())
            .finish()
    }
}

impl BlobFrontend {
    /// Creates a frontend with the default 100 MiB size limit.
    pub fn new(local: Arc<dyn BlobStorage>, sync: SyncCoordinator) -> Self {
        BlobFrontend {
            local,
            sync,
            locks: KeyedLock::new(),
            max_blob_size: AtomicUsize::new(DEFAULT_MAX_BLOB_SIZE),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            uploads: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Creates a frontend with the size limit from `config`.
    pub fn with_config(
        local: Arc<dyn BlobStorage>,
        sync: SyncCoordinator,
        config: &SyncConfig,
    ) -> Self {
        let frontend = Self::new(local, sync);
        frontend.set_max_blob_size(config.frontend.max_blob_size);
        frontend
    }

    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }

    // =========================================================================
    // Blob Access
    // =========================================================================

    /// Reads a blob, pulling it from the peers if the local store lacks it.
    ///
    /// ## Returns
    /// `None` when no peer produced the blob either.
    pub async fn get(&self, key: &str) -> SyncResult<Option<BlobRecord>> {
        {
            let _guard = self.locks.lock(key).await;
            if let Some(record) = self.local.get(key, &self.cancel).await? {
                return Ok(Some(record));
            }
        }

        debug!(key = %key, "Blob missing locally, asking peers");
        self.sync.download_blob(key).await;

        let _guard = self.locks.lock(key).await;
        Ok(self.local.get(key, &self.cancel).await?)
    }

    /// Writes a blob locally and schedules its upload to every peer.
    ///
    /// Returns once the local write is done. Upload failures never reach the
    /// caller; they show up in [`state_stream`](Self::state_stream).
    ///
    /// ## Errors
    /// * `SyncError::BlobTooLarge` - payload exceeds the limit; max-size
    ///   listeners have been notified and nothing was written
    /// * `SyncError::Validation` - invalid key, checked after the size
    pub async fn set(&self, record: BlobRecord) -> SyncResult<()> {
        let size = record.size();
        let max = self.max_blob_size();
        if let Err(e) = validate_blob_size(size, max) {
            warn!(key = %record.key, size, max, "Blob exceeds max size, rejected");
            self.notify_reached_max_blob_size(size);
            return Err(e.into());
        }

        validate_blob_key(&record.key)?;

        {
            let _guard = self.locks.lock(&record.key).await;
            self.local.set(&record, &self.cancel).await?;
        }

        let sync = self.sync.clone();
        self.uploads.spawn(async move {
            let key = record.key.clone();
            sync.upload_blob(record).await;
            debug!(key = %key, "Background upload settled");
        });

        Ok(())
    }

    // =========================================================================
    // Size Limit
    // =========================================================================

    pub fn max_blob_size(&self) -> usize {
        self.max_blob_size.load(Ordering::Relaxed)
    }

    /// Changes the size limit for subsequent `set` calls.
    pub fn set_max_blob_size(&self, max: usize) {
        info!(max_blob_size = max, "Max blob size updated");
        self.max_blob_size.store(max, Ordering::Relaxed);
    }

    /// Registers a callback invoked with the payload length of every rejected
    /// oversized `set`.
    pub fn on_reached_max_blob_size<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Removes a callback. Returns `false` if it was not registered.
    pub fn off_reached_max_blob_size(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    fn notify_reached_max_blob_size(&self, size: usize) {
        // Called outside the lock so listeners may (un)register.
        let listeners: Vec<SizeListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            listener(size);
        }
    }

    // =========================================================================
    // Sync Passthrough
    // =========================================================================

    /// See [`SyncCoordinator::full_download`].
    pub async fn full_download(
        &self,
        peer_id: Option<&str>,
        signal: Option<&CancellationToken>,
    ) -> SyncResult<()> {
        self.sync.full_download(peer_id, signal).await
    }

    pub fn state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn state_stream(&self) -> watch::Receiver<SyncState> {
        self.sync.state_stream()
    }

    pub fn blob_state_stream(&self, key: &str) -> watch::Receiver<BlobState> {
        self.sync.blob_state_stream(key)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Waits until every background upload scheduled so far has settled.
    pub async fn flush_uploads(&self) {
        self.uploads.close();
        self.uploads.wait().await;
        self.uploads.reopen();
    }

    /// Shuts the coordinator down and waits for background uploads, which
    /// are cancelled. Blobs whose upload was cut short are picked up by the
    /// next upload pass after a restart.
    pub async fn shutdown(&self) {
        info!(pending_uploads = self.uploads.len(), "Shutting down blob frontend");
        self.cancel.cancel();
        self.sync.shutdown().await;
        self.flush_uploads().await;
    }
}
