//! # Throttled Snapshots
//!
//! Turns a stream of "something changed" ticks into a replay-latest
//! [`watch::Receiver`] that is refreshed at most once per window.
//!
//! ## Timing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  changes:   x         x x x x            x                              │
//! │  time:    ──┼────┼────┼────┼────┼────┼────┼────┼────►                   │
//! │             0    1    2    3    4    5    6    7   (window = 1)         │
//! │  publish:   ▲         ▲    ▲                 ▲                          │
//! │           leading  leading trailing        leading                      │
//! │                                                                         │
//! │  A change after a quiet window publishes at once. Changes inside the    │
//! │  window are coalesced into one publication when the window closes, so  │
//! │  the final state is never lost.                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Snapshots equal to the current value are not re-published.

use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// Stream of change ticks. The payload carries no information.
pub type ChangeStream = BoxStream<'static, ()>;

/// Spawns a task that recomputes a snapshot on `changes`, at most once per
/// `window`, and returns a receiver holding the latest snapshot.
///
/// The task ends when `changes` ends or every receiver is dropped.
pub fn throttled<T, F>(changes: ChangeStream, window: Duration, compute: F) -> watch::Receiver<T>
where
    T: PartialEq + Send + Sync + 'static,
    F: Fn() -> T + Send + 'static,
{
    let (tx, rx) = watch::channel(compute());
    tokio::spawn(run_throttle(changes, window, compute, tx));
    rx
}

async fn run_throttle<T, F>(
    mut changes: ChangeStream,
    window: Duration,
    compute: F,
    tx: watch::Sender<T>,
) where
    T: PartialEq + Send + Sync + 'static,
    F: Fn() -> T + Send + 'static,
{
    // The initial snapshot counts as a publication.
    let mut last_publish = Instant::now();
    let mut pending = false;

    loop {
        let window_end = last_publish + window;

        tokio::select! {
            _ = tx.closed() => break,
            change = changes.next() => match change {
                Some(()) => {
                    if !pending && Instant::now() >= window_end {
                        publish(&tx, &compute);
                        last_publish = Instant::now();
                    } else {
                        pending = true;
                    }
                }
                None => {
                    if pending {
                        publish(&tx, &compute);
                    }
                    break;
                }
            },
            _ = sleep_until(window_end), if pending => {
                publish(&tx, &compute);
                pending = false;
                last_publish = Instant::now();
            }
        }
    }

    trace!("Throttled snapshot task finished");
}

fn publish<T: PartialEq, F: Fn() -> T>(tx: &watch::Sender<T>, compute: &F) {
    tx.send_if_modified(|current| {
        let next = compute();
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::broadcast;
    use tokio_stream::wrappers::BroadcastStream;

    fn setup() -> (
        Arc<AtomicUsize>,
        broadcast::Sender<()>,
        watch::Receiver<usize>,
    ) {
        let value = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = broadcast::channel(64);
        let changes = BroadcastStream::new(rx).map(|_| ()).boxed();

        let source = value.clone();
        let snapshots = throttled(changes, Duration::from_secs(1), move || {
            source.load(Ordering::SeqCst)
        });
        (value, tx, snapshots)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_coalesced_into_trailing_publish() {
        let (value, tx, mut rx) = setup();
        assert_eq!(*rx.borrow_and_update(), 0);

        let start = Instant::now();
        for i in 1..=10 {
            value.store(i, Ordering::SeqCst);
            tx.send(()).unwrap();
        }

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 10);

        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1), "published after {waited:?}");
        assert!(waited < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_after_quiet_period_is_immediate() {
        let (value, tx, mut rx) = setup();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let start = Instant::now();
        value.store(3, Ordering::SeqCst);
        tx.send(()).unwrap();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 3);
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_snapshot_is_not_republished() {
        let (_value, tx, mut rx) = setup();
        rx.borrow_and_update();
        tokio::time::sleep(Duration::from_secs(5)).await;

        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_change_flushed_when_stream_ends() {
        let (value, tx, mut rx) = setup();
        rx.borrow_and_update();

        value.store(9, Ordering::SeqCst);
        tx.send(()).unwrap();
        drop(tx);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 9);
    }
}
