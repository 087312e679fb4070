//! # Singleflight Registry
//!
//! At most one in-flight operation per key. Concurrent callers for the same
//! key join the running operation and all observe its single result.
//!
//! ## How It Works
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  caller A ──run("k")──► map miss ──► tokio::spawn(work) ──► Shared ──┐  │
//! │                                          │                          │  │
//! │  caller B ──run("k")──► map hit ─────────┼──── clone of Shared ─────┤  │
//! │                                          │                          │  │
//! │                                          ▼                          ▼  │
//! │                          task settles, removes "k"        A and B get  │
//! │                                                           same result  │
//! │                                                                         │
//! │  The work runs in its own task, so it keeps going even if every       │
//! │  caller stops waiting. A later run("k") starts a fresh operation.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

/// The spawned task panicked or was aborted.
#[derive(Debug, Clone, Error)]
#[error("in-flight task failed: {0}")]
pub struct FlightError(pub String);

/// Handle to a shared in-flight operation. Cloneable; awaiting it yields the
/// operation's result.
pub type Flight<T> = Shared<BoxFuture<'static, Result<T, FlightError>>>;

struct Entry<T> {
    id: u64,
    flight: Flight<T>,
}

type FlightMap<T> = Arc<Mutex<HashMap<String, Entry<T>>>>;

/// Drops the entry for `key` if it still belongs to flight `id`.
fn forget<T>(registry: &FlightMap<T>, key: &str, id: u64) {
    let mut map = registry.lock();
    if map.get(key).is_some_and(|entry| entry.id == id) {
        map.remove(key);
    }
}

/// Removes a settled entry, even when the work panics.
struct Deregister<T> {
    registry: FlightMap<T>,
    key: String,
    id: u64,
}

impl<T> Drop for Deregister<T> {
    fn drop(&mut self) {
        forget(&self.registry, &self.key, self.id);
    }
}

/// Keyed registry of in-flight operations.
pub struct SingleFlight<T> {
    inflight: FlightMap<T>,
    next_id: AtomicU64,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.inflight.lock().len())
            .finish()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the operation running under `key`, or starts one with `make`.
    ///
    /// `make` is only called when no operation is running. Must be called
    /// from within a tokio runtime.
    pub fn run<F, Fut>(&self, key: &str, make: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut map = self.inflight.lock();

        if let Some(existing) = map.get(key) {
            trace!(key = %key, "Joining in-flight operation");
            return existing.flight.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let work = make();
        let registry = Arc::clone(&self.inflight);
        let owned_key = key.to_string();

        // The map lock is held until the entry is inserted, so the task's
        // removal cannot run first. The guard only exists once the task is
        // polled: a closed runtime drops the unpolled task right here, under
        // the lock.
        let handle = tokio::spawn(async move {
            let _deregister = Deregister {
                registry,
                key: owned_key,
                id,
            };
            work.await
        });

        // A task that never ran left its entry behind
        let registry = Arc::clone(&self.inflight);
        let owned_key = key.to_string();
        let flight = async move {
            handle.await.map_err(|e| {
                forget(&registry, &owned_key, id);
                FlightError(e.to_string())
            })
        }
        .boxed()
        .shared();

        map.insert(
            key.to_string(),
            Entry {
                id,
                flight: flight.clone(),
            },
        );
        flight
    }

    /// True while an operation for `key` is running.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inflight.lock().contains_key(key)
    }

    /// Number of running operations.
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
