//! Job queue between the ingestion endpoint and the processing workers
//!
//! Producers only ever see [`JobQueue::enqueue`]; the consuming side is a
//! [`JobReceiver`] that worker tasks pull from. The in-process channel here
//! is not durable by itself: durability comes from the pending batch rows,
//! which are re-enqueued on startup (see [`super::worker::requeue_pending`]).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::storage::BatchId;

/// Hand-off point for asynchronous batch processing
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: BatchId) -> Result<(), QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job queue is closed")]
    Closed,
}

/// In-process queue backed by an unbounded tokio channel
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::UnboundedSender<BatchId>,
    depth: Arc<AtomicUsize>,
}

/// Consuming side shared by all worker tasks
pub struct JobReceiver {
    rx: Mutex<mpsc::UnboundedReceiver<BatchId>>,
    depth: Arc<AtomicUsize>,
}

/// Create a connected queue/receiver pair
pub fn channel() -> (ChannelQueue, JobReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        ChannelQueue {
            tx,
            depth: Arc::clone(&depth),
        },
        JobReceiver {
            rx: Mutex::new(rx),
            depth,
        },
    )
}

impl ChannelQueue {
    /// Jobs enqueued but not yet picked up by a worker
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

impl JobQueue for ChannelQueue {
    fn enqueue(&self, job: BatchId) -> Result<(), QueueError> {
        self.tx.send(job).map_err(|_| QueueError::Closed)?;
        self.depth.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl JobReceiver {
    /// Wait for the next job; `None` once every queue handle is dropped
    pub async fn next(&self) -> Option<BatchId> {
        let job = self.rx.lock().await.recv().await;
        if job.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        job
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}
