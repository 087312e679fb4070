//! # Connection State
//!
//! Every storage backend exposes a [`ConnectionHandle`] so the engine can
//! wait until both ends of a peer are reachable before reconciling.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Disconnected ──► Connecting ──► Connected                            │
//! │        ▲                              │                                 │
//! │        │                              │ link lost                       │
//! │        └────────── Reconnecting ◄─────┘                                 │
//! │                                                                         │
//! │   wait_for_connected() resolves on Connected, or fails when the        │
//! │   caller's CancellationToken fires.                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use blobsync_core::{StorageError, StorageResult};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Connection state of a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Link lost, reconnection in progress.
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Shared, observable connection state.
///
/// Clones observe and drive the same state.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    state: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionHandle {
    /// Creates a handle in the given state.
    pub fn new(initial: ConnectionState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state: Arc::new(state),
        }
    }

    /// A handle that starts connected (local stores, in-process backends).
    pub fn connected() -> Self {
        Self::new(ConnectionState::Connected)
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// True when the backend is ready for requests.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Publishes a new state to all waiters.
    pub fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "Connection state changed");
        }
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Waits until the state is `Connected`.
    ///
    /// ## Returns
    /// * `Ok(())` - connected (immediately, if already connected)
    /// * `Err(StorageError::Cancelled)` - `cancel` fired first
    pub async fn wait_for_connected(&self, cancel: &CancellationToken) -> StorageResult<()> {
        let mut rx = self.state.subscribe();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            res = rx.wait_for(|s| *s == ConnectionState::Connected) => {
                // The sender lives as long as `self`, so this cannot close.
                res.map(|_| ()).map_err(|_| StorageError::Disconnected)
            }
        }
    }
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }

    #[tokio::test]
    async fn test_wait_when_already_connected() {
        let handle = ConnectionHandle::connected();
        handle
            .wait_for_connected(&CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_resolves_on_transition() {
        let handle = ConnectionHandle::new(ConnectionState::Connecting);
        let driver = handle.clone();

        let waiter = tokio::spawn(async move {
            handle.wait_for_connected(&CancellationToken::new()).await
        });

        tokio::task::yield_now().await;
        assert!(!driver.is_connected());
        driver.set_state(ConnectionState::Connected);

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cancellable() {
        let handle = ConnectionHandle::new(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let err = handle.wait_for_connected(&cancel).await.unwrap_err();
        assert_eq!(err, StorageError::Cancelled);
    }
}
