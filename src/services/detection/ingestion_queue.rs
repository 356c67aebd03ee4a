// Ingestion Queue
// Unbounded FIFO handoff from the producer to one detector worker.
// push never blocks and never fails from the producer's point of view; there is no backpressure,
// so a slow oracle lets the backlog grow without limit. `pending()` exposes that backlog.

use crate::models::Fragment;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Producer half. Cloneable so the session can keep one per detector.
#[derive(Clone)]
pub struct IngestionQueue {
    tx: mpsc::UnboundedSender<Fragment>,
    pending: Arc<AtomicUsize>,
}

/// Consumer half, owned by exactly one worker.
pub struct IngestionReceiver {
    rx: mpsc::UnboundedReceiver<Fragment>,
    pending: Arc<AtomicUsize>,
}

/// Outcome of a timed pop.
#[derive(Debug, PartialEq)]
pub enum Popped {
    Fragment(Fragment),
    /// Nothing arrived within the timeout
    Empty,
    /// Every producer handle is gone and the queue is drained
    Closed,
}

impl IngestionQueue {
    pub fn new() -> (IngestionQueue, IngestionReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        (
            IngestionQueue {
                tx,
                pending: pending.clone(),
            },
            IngestionReceiver { rx, pending },
        )
    }

    pub fn push(&self, fragment: Fragment) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.tx.send(fragment) {
            // Worker already gone (session stopping); the fragment has nowhere to go.
            self.pending.fetch_sub(1, Ordering::SeqCst);
            debug!("[QUEUE] dropped fragment {} after worker exit", e.0.timestamp);
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl IngestionReceiver {
    /// Next fragment in arrival order, or `Empty` once `timeout` elapses.
    pub async fn pop(&mut self, timeout: Duration) -> Popped {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(fragment)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Popped::Fragment(fragment)
            }
            Ok(None) => Popped::Closed,
            Err(_) => Popped::Empty,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order_and_pending() {
        let (queue, mut rx) = IngestionQueue::new();
        for i in 0..5u64 {
            queue.push(Fragment::new(i, format!("{}", i * 5), format!("text {}", i)));
        }
        assert_eq!(queue.pending(), 5);

        for i in 0..5u64 {
            match rx.pop(Duration::from_millis(10)).await {
                Popped::Fragment(f) => assert_eq!(f.seq, i),
                other => panic!("expected fragment, got {other:?}"),
            }
        }
        assert_eq!(rx.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_times_out_when_empty() {
        let (_queue, mut rx) = IngestionQueue::new();
        let started = tokio::time::Instant::now();
        assert_eq!(rx.pop(Duration::from_secs(1)).await, Popped::Empty);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_closed_after_producers_dropped() {
        let (queue, mut rx) = IngestionQueue::new();
        queue.push(Fragment::new(0, "0", "last words"));
        drop(queue);
        assert!(matches!(rx.pop(Duration::from_millis(10)).await, Popped::Fragment(_)));
        assert_eq!(rx.pop(Duration::from_millis(10)).await, Popped::Closed);
    }

    #[test]
    fn test_push_after_receiver_dropped_is_silent() {
        let (queue, rx) = IngestionQueue::new();
        drop(rx);
        queue.push(Fragment::new(0, "0", "late"));
        assert_eq!(queue.pending(), 0);
    }
}
