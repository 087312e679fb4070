//! # Peer Sync Status
//!
//! Observable bookkeeping for one peer: which blobs are queued, in flight,
//! failed, or too large, and whether the remote is out of space.
//!
//! ## Bookkeeping
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        PeerSyncStatus                                   │
//! │                                                                         │
//! │  will_upload   {keys}  ─┐                                               │
//! │  uploading     {keys}  ─┴─► SyncState.uploading   = |union|            │
//! │  will_download {keys}  ─┐                                               │
//! │  downloading   {keys}  ─┴─► SyncState.downloading = |union|            │
//! │  errors        {key → message} ──► SyncState.error = count              │
//! │  over_size     {keys}                                                   │
//! │  over_capacity bool    ──────────► SyncState.over_capacity             │
//! │                                                                         │
//! │  Every mutation that changes something emits a StatusEvent on a        │
//! │  broadcast channel; state streams are throttled views of it.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use blobsync_core::{BlobState, SyncState};
use futures_util::future;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;

use crate::throttle::{throttled, ChangeStream};

/// Capacity of the event channel. Slow subscribers see a lag, which the
/// state streams treat as "something changed".
const EVENT_CAPACITY: usize = 1024;

// =============================================================================
// Events
// =============================================================================

/// What changed in a [`PeerSyncStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Something about this blob changed.
    Blob(String),
    /// A peer-wide flag changed.
    Peer,
}

impl StatusEvent {
    /// True if a subscriber watching `key` should recompute.
    pub fn affects(&self, key: &str) -> bool {
        match self {
            StatusEvent::Blob(k) => k == key,
            StatusEvent::Peer => true,
        }
    }
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Default)]
struct StatusInner {
    over_capacity: bool,
    will_upload: HashSet<String>,
    uploading: HashSet<String>,
    will_download: HashSet<String>,
    downloading: HashSet<String>,
    errors: HashMap<String, String>,
    over_size: HashSet<String>,
}

/// Status of one peer.
#[derive(Debug)]
pub struct PeerSyncStatus {
    inner: Mutex<StatusInner>,
    events: broadcast::Sender<StatusEvent>,
}

impl Default for PeerSyncStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSyncStatus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(StatusInner::default()),
            events,
        }
    }

    fn update(&self, event: StatusEvent, f: impl FnOnce(&mut StatusInner) -> bool) {
        let changed = f(&mut self.inner.lock());
        if changed {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    fn blob(&self, key: &str, f: impl FnOnce(&mut StatusInner) -> bool) {
        self.update(StatusEvent::Blob(key.to_string()), f);
    }

    // =========================================================================
    // Upload
    // =========================================================================

    /// Queues `key` for upload by a reconciliation pass.
    pub fn blob_will_upload(&self, key: &str) {
        self.blob(key, |s| s.will_upload.insert(key.to_string()));
    }

    pub fn blob_will_upload_finish(&self, key: &str) {
        self.blob(key, |s| s.will_upload.remove(key));
    }

    pub fn blob_uploading(&self, key: &str) {
        self.blob(key, |s| s.uploading.insert(key.to_string()));
    }

    /// Upload attempt settled. Leaves error state alone.
    pub fn blob_upload_finish(&self, key: &str) {
        self.blob(key, |s| {
            let a = s.uploading.remove(key);
            let b = s.will_upload.remove(key);
            a || b
        });
    }

    // =========================================================================
    // Download
    // =========================================================================

    pub fn blob_will_download(&self, key: &str) {
        self.blob(key, |s| s.will_download.insert(key.to_string()));
    }

    pub fn blob_will_download_finish(&self, key: &str) {
        self.blob(key, |s| s.will_download.remove(key));
    }

    pub fn blob_downloading(&self, key: &str) {
        self.blob(key, |s| s.downloading.insert(key.to_string()));
    }

    /// Download attempt settled. Leaves error state alone.
    pub fn blob_download_finish(&self, key: &str) {
        self.blob(key, |s| {
            let a = s.downloading.remove(key);
            let b = s.will_download.remove(key);
            a || b
        });
    }

    // =========================================================================
    // Errors
    // =========================================================================

    /// Records the last failure message for `key`.
    pub fn blob_error(&self, key: &str, message: impl Into<String>) {
        let message = message.into();
        self.blob(key, |s| {
            s.errors.insert(key.to_string(), message.clone()).as_ref() != Some(&message)
        });
    }

    /// Marks `key` as refused by the remote because of its size.
    pub fn blob_over_size(&self, key: &str) {
        self.blob(key, |s| s.over_size.insert(key.to_string()));
    }

    /// Clears the error message and the over-size flag of `key`.
    pub fn blob_error_free(&self, key: &str) {
        self.blob(key, |s| {
            let a = s.errors.remove(key).is_some();
            let b = s.over_size.remove(key);
            a || b
        });
    }

    pub fn remote_over_capacity(&self) {
        self.update(StatusEvent::Peer, |s| !std::mem::replace(&mut s.over_capacity, true));
    }

    pub fn remote_over_capacity_free(&self) {
        self.update(StatusEvent::Peer, |s| std::mem::replace(&mut s.over_capacity, false));
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn is_over_capacity(&self) -> bool {
        self.inner.lock().over_capacity
    }

    pub fn is_over_size(&self, key: &str) -> bool {
        self.inner.lock().over_size.contains(key)
    }

    /// Aggregate counters for this peer.
    pub fn snapshot(&self) -> SyncState {
        let s = self.inner.lock();
        SyncState {
            uploading: s.will_upload.union(&s.uploading).count(),
            downloading: s.will_download.union(&s.downloading).count(),
            error: s.errors.len(),
            over_capacity: s.over_capacity,
        }
    }

    /// State of one blob on this peer.
    pub fn blob_state(&self, key: &str) -> BlobState {
        let s = self.inner.lock();
        BlobState {
            uploading: s.will_upload.contains(key) || s.uploading.contains(key),
            downloading: s.will_download.contains(key) || s.downloading.contains(key),
            over_size: s.over_size.contains(key),
            error_message: s.errors.get(key).cloned(),
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Raw event subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Ticks on every change.
    pub fn changes(&self) -> ChangeStream {
        BroadcastStream::new(self.subscribe()).map(|_| ()).boxed()
    }

    /// Ticks on changes that affect `key`. Lagged receivers always tick.
    pub fn blob_changes(&self, key: &str) -> ChangeStream {
        let key = key.to_string();
        BroadcastStream::new(self.subscribe())
            .filter_map(move |event| {
                let hit = match event {
                    Ok(event) => event.affects(&key),
                    Err(_) => true,
                };
                future::ready(hit.then_some(()))
            })
            .boxed()
    }

    /// Throttled, replay-latest view of [`snapshot`](Self::snapshot).
    pub fn state_stream(self: &Arc<Self>, window: Duration) -> watch::Receiver<SyncState> {
        let status = Arc::clone(self);
        throttled(self.changes(), window, move || status.snapshot())
    }

    /// Throttled, replay-latest view of [`blob_state`](Self::blob_state).
    pub fn blob_state_stream(
        self: &Arc<Self>,
        key: &str,
        window: Duration,
    ) -> watch::Receiver<BlobState> {
        let status = Arc::clone(self);
        let owned = key.to_string();
        throttled(self.blob_changes(key), window, move || {
            status.blob_state(&owned)
        })
    }

    /// Marks `keys` as queued for upload until the returned guard drops.
    pub fn mark_will_upload(self: &Arc<Self>, keys: Vec<String>) -> PendingMarks {
        for key in &keys {
            self.blob_will_upload(key);
        }
        PendingMarks {
            status: Arc::clone(self),
            keys,
            direction: Direction::Upload,
        }
    }

    /// Marks `keys` as queued for download until the returned guard drops.
    pub fn mark_will_download(self: &Arc<Self>, keys: Vec<String>) -> PendingMarks {
        for key in &keys {
            self.blob_will_download(key);
        }
        PendingMarks {
            status: Arc::clone(self),
            keys,
            direction: Direction::Download,
        }
    }
}

// =============================================================================
// Pending Marks
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Direction {
    Upload,
    Download,
}

/// Clears queued-for-transfer marks when dropped, however the pass ends.
#[derive(Debug)]
pub struct PendingMarks {
    status: Arc<PeerSyncStatus>,
    keys: Vec<String>,
    direction: Direction,
}

impl PendingMarks {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for PendingMarks {
    fn drop(&mut self) {
        for key in &self.keys {
            match self.direction {
                Direction::Upload => self.status.blob_will_upload_finish(key),
                Direction::Download => self.status.blob_will_download_finish(key),
            }
        }
    }
}
