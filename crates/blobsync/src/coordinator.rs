//! # Sync Coordinator
//!
//! Fans single-blob operations out to every peer, merges their status into
//! one aggregate view and owns the lifecycle of the background upload loops.
//!
//! ## Coordinator Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncCoordinator                                  │
//! │                                                                         │
//! │  download_blob ──► race all peers ──► first non-cancelled result       │
//! │  upload_blob ────► every peer in parallel, wait for all                 │
//! │  full_download ──► one memoized pull per peer (raced against an         │
//! │                    optional caller signal)                              │
//! │                                                                         │
//! │         ┌──────────────────┬──────────────────┬──────────────────┐      │
//! │         ▼                  ▼                  ▼                  │      │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐            │      │
//! │  │ PeerSync A  │   │ PeerSync B  │   │ PeerSync C  │   ...      │      │
//! │  │ upload loop │   │ upload loop │   │ upload loop │            │      │
//! │  └──────┬──────┘   └──────┬──────┘   └──────┬──────┘            │      │
//! │         └──────────────────┴──────────────────┘                  │      │
//! │                            │ status events                       │      │
//! │                            ▼                                     │      │
//! │              state_stream(): summed counters, OR'd flags          │      │
//! │                                                                         │
//! │  LIFECYCLE:                                                             │
//! │  start()    spawn one upload loop per peer (once)                       │
//! │  stop()     cancel the shared token, install a fresh one                │
//! │  shutdown() stop() and wait for every loop to exit                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation runs under the coordinator's shared cancellation token, so
//! `stop()` cancels in-flight transfers as well as the loops.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use blobsync_core::{BlobRecord, BlobState, SyncState};
use futures_util::future::{join_all, select_all};
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{Cancelled, SyncError, SyncResult};
use crate::peer::{PeerSettings, PeerSync};
use crate::singleflight::SingleFlight;
use crate::status::PeerSyncStatus;
use crate::storage::{BlobStorage, SyncMetadataStore};
use crate::throttle::throttled;

// =============================================================================
// Sync Coordinator
// =============================================================================

struct Control {
    cancel: CancellationToken,
    started: bool,
}

struct CoordinatorInner {
    peers: Vec<PeerSync>,
    control: Mutex<Control>,
    loops: TaskTracker,
    full_downloads: SingleFlight<Result<(), Cancelled>>,
    throttle: Duration,
}

/// Replication across every configured peer. Cheap to clone.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("peers", &self.inner.peers)
            .field("started", &self.is_started())
            .finish()
    }
}

impl SyncCoordinator {
    /// Starts building a coordinator around the local store.
    pub fn builder(
        local: Arc<dyn BlobStorage>,
        metadata: Arc<dyn SyncMetadataStore>,
    ) -> SyncCoordinatorBuilder {
        SyncCoordinatorBuilder::new(local, metadata)
    }

    pub fn peers(&self) -> &[PeerSync] {
        &self.inner.peers
    }

    /// Looks up a peer by id.
    pub fn peer(&self, peer_id: &str) -> Option<&PeerSync> {
        self.inner.peers.iter().find(|p| p.peer_id() == peer_id)
    }

    /// True between `start()` and `stop()`.
    pub fn is_started(&self) -> bool {
        self.inner.control.lock().started
    }

    fn token(&self) -> CancellationToken {
        self.inner.control.lock().cancel.clone()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawns each peer's upload loop. Calling it again while started does
    /// nothing.
    pub fn start(&self) {
        let mut control = self.inner.control.lock();
        if control.started {
            debug!("Sync coordinator already started");
            return;
        }
        control.started = true;

        for peer in &self.inner.peers {
            let peer = peer.clone();
            let cancel = control.cancel.clone();
            self.inner
                .loops
                .spawn(async move { peer.full_upload_loop(cancel).await });
        }

        info!(peers = self.inner.peers.len(), "Sync coordinator started");
    }

    /// Cancels every loop and in-flight operation. A later `start()` runs
    /// with a fresh token.
    pub fn stop(&self) {
        let mut control = self.inner.control.lock();
        control.cancel.cancel();
        control.cancel = CancellationToken::new();

        if std::mem::replace(&mut control.started, false) {
            info!("Sync coordinator stopped");
        }
    }

    /// Stops and waits for every upload loop to exit.
    pub async fn shutdown(&self) {
        self.stop();

        let loops = &self.inner.loops;
        loops.close();
        loops.wait().await;
        loops.reopen();
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    /// Fetches `key` from whichever peer answers first.
    ///
    /// ## Returns
    /// The first result from a peer that was not cancelled. `false` if there
    /// are no peers or every peer was cancelled. Peers still running keep
    /// going in the background.
    pub async fn download_blob(&self, key: &str) -> bool {
        let cancel = self.token();

        let mut pending: Vec<_> = self
            .inner
            .peers
            .iter()
            .map(|peer| Box::pin(peer.download_blob(key, &cancel)))
            .collect();

        while !pending.is_empty() {
            let (settled, _, rest) = select_all(pending).await;
            match settled {
                Ok(found) => return found,
                Err(e) => {
                    debug!(key = %key, error = %e, "Peer download did not settle");
                    pending = rest;
                }
            }
        }

        false
    }

    /// Pushes `record` to every peer and waits for all of them. Failures are
    /// visible through the state streams only.
    pub async fn upload_blob(&self, record: BlobRecord) {
        let cancel = self.token();

        let uploads = self
            .inner
            .peers
            .iter()
            .map(|peer| peer.upload_blob(record.clone(), &cancel));

        for (peer, outcome) in self.inner.peers.iter().zip(join_all(uploads).await) {
            if let Err(e) = outcome {
                debug!(peer = %peer.peer_id(), key = %record.key, error = %e, "Peer upload did not settle");
            }
        }
    }

    /// Pulls every blob missing locally from one peer, or from all peers.
    ///
    /// Concurrent calls for the same peer share one pull. `signal` only
    /// controls what this caller waits for: when it fires this returns
    /// `SyncError::Cancelled` right away while the pull runs on to
    /// completion. `stop()` cancels the pull itself.
    ///
    /// ## Arguments
    /// * `peer_id` - Restrict the pull to this peer
    /// * `signal` - Stop waiting when this token fires
    ///
    /// ## Errors
    /// * `SyncError::UnknownPeer` - `peer_id` names no peer
    /// * `SyncError::Cancelled` - `signal` fired or the coordinator stopped
    pub async fn full_download(
        &self,
        peer_id: Option<&str>,
        signal: Option<&CancellationToken>,
    ) -> SyncResult<()> {
        let targets: Vec<&PeerSync> = match peer_id {
            Some(id) => vec![self
                .peer(id)
                .ok_or_else(|| SyncError::UnknownPeer(id.to_string()))?],
            None => self.inner.peers.iter().collect(),
        };

        let cancel = self.token();
        let flights: Vec<_> = targets
            .into_iter()
            .map(|peer| {
                let id = peer.peer_id().to_string();
                let peer = peer.clone();
                let token = cancel.clone();
                self.inner.full_downloads.run(&id, move || async move {
                    match peer.full_download(&token).await {
                        Ok(()) => Ok(()),
                        Err(e) if e.is_cancelled() => Err(Cancelled),
                        Err(e) => {
                            warn!(peer = %peer.peer_id(), error = %e, "Full download failed");
                            Ok(())
                        }
                    }
                })
            })
            .collect();

        let work = async move {
            let mut cancelled = false;
            for settled in join_all(flights).await {
                match settled {
                    Ok(Ok(())) => {}
                    Ok(Err(Cancelled)) => cancelled = true,
                    Err(e) => error!(error = %e, "Full download task failed"),
                }
            }

            if cancelled {
                Err(SyncError::Cancelled)
            } else {
                Ok(())
            }
        };

        match signal {
            Some(signal) => tokio::select! {
                outcome = work => outcome,
                _ = signal.cancelled() => Err(SyncError::Cancelled),
            },
            None => work.await,
        }
    }

    // =========================================================================
    // Aggregate State
    // =========================================================================

    fn statuses(&self) -> Vec<Arc<PeerSyncStatus>> {
        self.inner
            .peers
            .iter()
            .map(|p| Arc::clone(p.status()))
            .collect()
    }

    /// Summed state across peers.
    pub fn state(&self) -> SyncState {
        SyncState::merge(self.inner.peers.iter().map(|p| p.status().snapshot()))
    }

    /// Throttled, replay-latest view of [`state`](Self::state).
    pub fn state_stream(&self) -> watch::Receiver<SyncState> {
        let statuses = self.statuses();
        let changes = stream::select_all(statuses.iter().map(|s| s.changes())).boxed();

        throttled(changes, self.inner.throttle, move || {
            SyncState::merge(statuses.iter().map(|s| s.snapshot()))
        })
    }

    /// State of one blob, merged across peers.
    pub fn blob_state(&self, key: &str) -> BlobState {
        BlobState::merge(self.inner.peers.iter().map(|p| p.status().blob_state(key)))
    }

    /// Throttled, replay-latest view of [`blob_state`](Self::blob_state).
    pub fn blob_state_stream(&self, key: &str) -> watch::Receiver<BlobState> {
        let statuses = self.statuses();
        let changes = stream::select_all(statuses.iter().map(|s| s.blob_changes(key))).boxed();
        let key = key.to_string();

        throttled(changes, self.inner.throttle, move || {
            BlobState::merge(statuses.iter().map(|s| s.blob_state(&key)))
        })
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`SyncCoordinator`].
///
/// ## Example
/// ```rust,ignore
/// let sync = SyncCoordinator::builder(local, metadata)
///     .remote("cloud", cloud)
///     .remote("mirror", mirror)
///     .config(&config)
///     .build()?;
/// sync.start();
/// ```
pub struct SyncCoordinatorBuilder {
    local: Arc<dyn BlobStorage>,
    metadata: Arc<dyn SyncMetadataStore>,
    remotes: Vec<(String, Arc<dyn BlobStorage>)>,
    settings: PeerSettings,
    throttle: Duration,
}

impl SyncCoordinatorBuilder {
    /// Creates a builder with default settings and no peers.
    pub fn new(local: Arc<dyn BlobStorage>, metadata: Arc<dyn SyncMetadataStore>) -> Self {
        let defaults = SyncConfig::default();
        SyncCoordinatorBuilder {
            local,
            metadata,
            remotes: Vec::new(),
            settings: PeerSettings::from(&defaults),
            throttle: defaults.status.throttle(),
        }
    }

    /// Adds a peer.
    pub fn remote(mut self, peer_id: impl Into<String>, store: Arc<dyn BlobStorage>) -> Self {
        self.remotes.push((peer_id.into(), store));
        self
    }

    /// Takes retry, loop and throttle settings from `config`.
    pub fn config(mut self, config: &SyncConfig) -> Self {
        self.settings = PeerSettings::from(config);
        self.throttle = config.status.throttle();
        self
    }

    pub fn settings(mut self, settings: PeerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn throttle(mut self, window: Duration) -> Self {
        self.throttle = window;
        self
    }

    /// Builds the coordinator. Nothing runs until `start()`.
    ///
    /// ## Errors
    /// * `SyncError::DuplicatePeer` - two remotes share an id
    pub fn build(self) -> SyncResult<SyncCoordinator> {
        let mut seen = HashSet::new();
        for (id, _) in &self.remotes {
            if !seen.insert(id.as_str()) {
                return Err(SyncError::DuplicatePeer(id.clone()));
            }
        }

        let peers = self
            .remotes
            .into_iter()
            .map(|(id, remote)| {
                PeerSync::new(
                    id,
                    Arc::clone(&self.local),
                    remote,
                    Arc::clone(&self.metadata),
                    self.settings.clone(),
                )
            })
            .collect();

        Ok(SyncCoordinator {
            inner: Arc::new(CoordinatorInner {
                peers,
                control: Mutex::new(Control {
                    cancel: CancellationToken::new(),
                    started: false,
                }),
                loops: TaskTracker::new(),
                full_downloads: SingleFlight::new(),
                throttle: self.throttle,
            }),
        })
    }
}
