//! Bounded ingestion queue.
//!
//! The single backpressure point between listeners and workers. A full
//! queue drops the newest item and counts it; producers never block, so a
//! slow consumer degrades completeness, not ingestion liveness.

use crate::types::MetricSample;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Producer half handed to listeners (and the canary's self-injection).
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<MetricSample>,
    shared: Arc<QueueCounters>,
}

/// Consumer half handed to the worker pool.
pub struct QueueReceiver {
    rx: mpsc::Receiver<MetricSample>,
    shared: Arc<QueueCounters>,
}

#[derive(Debug, Default)]
struct QueueCounters {
    depth: AtomicUsize,
    dropped: AtomicU64,
}

/// Build a bounded queue. Depth and drop counters are the component's only
/// observability surface.
pub fn bounded(max_queue_size: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(max_queue_size);
    let shared = Arc::new(QueueCounters::default());
    (
        QueueSender {
            tx,
            shared: Arc::clone(&shared),
        },
        QueueReceiver { rx, shared },
    )
}

impl QueueSender {
    /// Enqueue without blocking. Returns `false` when the item was dropped
    /// because the queue is at its bound.
    pub fn try_push(&self, item: MetricSample) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.shared.depth.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl QueueReceiver {
    /// Await the next item. `None` means every sender is gone.
    pub async fn pop(&mut self) -> Option<MetricSample> {
        let item = self.rx.recv().await;
        if item.is_some() {
            self.shared.depth.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    pub fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
