//! Asynchronous ingestion for Tracehub
//!
//! The HTTP endpoint only stores the raw batch and enqueues its id:
//! - [`queue`]: job hand-off between the endpoint and the workers
//! - [`worker`]: decode, project and persist one batch at a time

pub mod queue;
pub mod worker;

pub use queue::{channel, ChannelQueue, JobQueue, JobReceiver, QueueError};
pub use worker::{
    requeue_pending, BatchProcessor, ProcessOutcome, RetryPolicy, WorkerError, WorkerPool,
    WorkerStatsSnapshot,
};
