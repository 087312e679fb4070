//! # Keyed Lock
//!
//! Per-key mutual exclusion for frontend reads and writes. Different keys
//! never contend; entries are dropped once nobody holds or waits on a key.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A key's mutex and how many callers hold or wait on it.
#[derive(Debug, Default)]
struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    users: usize,
}

type LockMap = Arc<Mutex<HashMap<String, Slot>>>;

/// Registry of per-key async mutexes.
#[derive(Debug, Default, Clone)]
pub struct KeyedLock {
    locks: LockMap,
}

/// Held lock on one key; released on drop.
///
/// Also built before the wait starts, so a caller that gives up while
/// queued still gives back its slot.
#[derive(Debug)]
pub struct KeyedLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
    key: String,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyedLockGuard {
        let mutex = {
            let mut locks = self.locks.lock();
            let slot = locks.entry(key.to_string()).or_default();
            slot.users += 1;
            Arc::clone(&slot.mutex)
        };

        let mut held = KeyedLockGuard {
            guard: None,
            locks: Arc::clone(&self.locks),
            key: key.to_string(),
        };
        held.guard = Some(mutex.lock_owned().await);
        held
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.locks.lock().len()
    }
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self.locks.lock();
        if let Some(slot) = locks.get_mut(&self.key) {
            slot.users -= 1;
            if slot.users == 0 {
                locks.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_same_key_is_exclusive() {
        let locks = KeyedLock::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("k").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let locks = KeyedLock::new();
        let _a = locks.lock("a").await;
        let _b = locks.lock("b").await;
        assert_eq!(locks.active_keys(), 2);
    }

    #[tokio::test]
    async fn test_entry_survives_while_waiter_queued() {
        let locks = KeyedLock::new();
        let first = locks.lock("k").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("k").await;
            })
        };
        tokio::task::yield_now().await;

        drop(first);
        // The queued waiter keeps the entry alive
        assert_eq!(locks.active_keys(), 1);

        waiter.await.unwrap();
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_releases_its_slot() {
        let locks = KeyedLock::new();
        let first = locks.lock("k").await;

        let gave_up = tokio::time::timeout(Duration::from_secs(1), locks.lock("k")).await;
        assert!(gave_up.is_err());
        assert_eq!(locks.active_keys(), 1);

        drop(first);
        assert_eq!(locks.active_keys(), 0);

        // The key is usable again afterwards
        let _again = locks.lock("k").await;
        assert_eq!(locks.active_keys(), 1);
    }
}
