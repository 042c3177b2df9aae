//! Asynchronous batch processing
//!
//! A [`BatchProcessor`] takes one raw batch from `pending` to `processed` or
//! `error`. The status write always happens, and it happens before any
//! failure is reported to the caller, so a failed batch is never left
//! looking pending. [`WorkerPool`] runs processors on tokio tasks fed by a
//! [`JobReceiver`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use super::queue::{JobQueue, JobReceiver, QueueError};
use crate::otel::{parse_trace_request, project, ExtractedTrace, ProjectionError};
use crate::storage::{
    BatchId, BatchStatus, CommitSummary, DuplicateSpanPolicy, ProjectId, RawIngestedBatch,
    StoreError, TraceStore,
};

/// How often a failed persisting transaction is attempted before the batch
/// is marked `error`. Projection failures are never retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    #[default]
    None,
    /// Total attempts for the commit, including the first
    Attempts(u32),
}

impl RetryPolicy {
    fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::None => 1,
            RetryPolicy::Attempts(n) => (*n).max(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Projection(#[from] ProjectionError),

    #[error("document contains no resource spans")]
    NothingToProject,
}

/// Outcome of one processing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed(CommitSummary),
    /// Batch had already left `pending` (redelivered job)
    AlreadyFinished(BatchStatus),
}

/// Runs the projection pipeline for single batches
pub struct BatchProcessor {
    store: Arc<dyn TraceStore>,
    duplicates: DuplicateSpanPolicy,
    retry: RetryPolicy,
}

impl BatchProcessor {
    pub fn new(store: Arc<dyn TraceStore>) -> Self {
        Self {
            store,
            duplicates: DuplicateSpanPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicateSpanPolicy) -> Self {
        self.duplicates = policy;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Process one batch and record its terminal status
    pub fn process(&self, id: BatchId) -> Result<ProcessOutcome, WorkerError> {
        let batch = self.store.get_batch(id)?;
        if batch.status != BatchStatus::Pending {
            tracing::debug!(batch = %id, status = %batch.status, "Batch already finished, skipping");
            return Ok(ProcessOutcome::AlreadyFinished(batch.status));
        }

        let result = self.project_and_commit(&batch);

        let (status, message) = match &result {
            Ok(_) => (BatchStatus::Processed, None),
            Err(e) => (BatchStatus::Error, Some(e.to_string())),
        };
        if let Err(e) = self.store.finish_batch(id, status, message) {
            tracing::error!(batch = %id, "Failed to record batch status {}: {}", status, e);
            return Err(result.err().unwrap_or(WorkerError::Store(e)));
        }

        match &result {
            Ok(summary) => tracing::debug!(
                batch = %id,
                trace = summary.trace,
                inserted = summary.spans_inserted,
                skipped = summary.spans_skipped,
                "Batch processed"
            ),
            Err(e) => tracing::error!(batch = %id, "Batch failed: {}", e),
        }

        result.map(ProcessOutcome::Processed)
    }

    fn project_and_commit(&self, batch: &RawIngestedBatch) -> Result<CommitSummary, WorkerError> {
        let request = parse_trace_request(&batch.payload)?;
        let trace = project(&request, batch.received_at)?.ok_or(WorkerError::NothingToProject)?;
        self.commit(batch.project_id, &trace)
    }

    fn commit(&self, project: ProjectId, trace: &ExtractedTrace) -> Result<CommitSummary, WorkerError> {
        let attempts = self.retry.max_attempts();
        let mut attempt = 1;
        loop {
            match self.store.commit_projection(project, trace, self.duplicates) {
                Ok(summary) => return Ok(summary),
                Err(e) if attempt < attempts => {
                    tracing::warn!(attempt, "Commit failed, retrying: {}", e);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Counters for processed jobs
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Pool of tokio tasks draining the job queue
pub struct WorkerPool {
    processor: Arc<BatchProcessor>,
    receiver: Arc<JobReceiver>,
    concurrency: usize,
    running: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
}

impl WorkerPool {
    pub fn new(processor: Arc<BatchProcessor>, receiver: JobReceiver, concurrency: usize) -> Self {
        Self {
            processor,
            receiver: Arc::new(receiver),
            concurrency: concurrency.max(1),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(WorkerStats::default()),
        }
    }

    /// Start the worker tasks
    pub fn start(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Starting {} batch workers", self.concurrency);

        (0..self.concurrency)
            .map(|n| {
                let pool = Arc::clone(&self);
                tokio::spawn(async move { pool.run(n).await })
            })
            .collect()
    }

    async fn run(&self, worker: usize) {
        while self.running.load(Ordering::SeqCst) {
            let Some(id) = self.receiver.next().await else {
                break;
            };

            // decoding and projection are CPU-bound
            let processor = Arc::clone(&self.processor);
            match tokio::task::spawn_blocking(move || processor.process(id)).await {
                Ok(Ok(ProcessOutcome::Processed(_))) => {
                    self.stats.processed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Ok(ProcessOutcome::AlreadyFinished(_))) => {
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(_)) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::error!(worker, batch = %id, "Batch worker panicked: {}", e);
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        tracing::info!(worker, "Batch worker stopped");
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the workers after their current job
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Enqueue every batch still pending, e.g. after restoring a snapshot
pub fn requeue_pending(store: &dyn TraceStore, queue: &dyn JobQueue) -> Result<usize, QueueError> {
    let pending = store.pending_batches();
    for id in &pending {
        queue.enqueue(*id)?;
    }
    if !pending.is_empty() {
        tracing::info!("Re-enqueued {} pending batches", pending.len());
    }
    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::queue::channel;
    use crate::otel::testing::*;
    use crate::otel::TraceId;
    use crate::storage::{MemoryStore, SpanRecord, StoreCounts, TraceRecord};
    use chrono::{DateTime, Utc};
    use prost::Message;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const PROJECT: ProjectId = ProjectId(1);

    fn setup() -> (Arc<MemoryStore>, BatchProcessor) {
        let store = Arc::new(MemoryStore::new());
        let processor = BatchProcessor::new(store.clone());
        (store, processor)
    }

    #[test]
    fn test_process_two_span_document() {
        let (store, processor) = setup();
        let id = store.create_batch(PROJECT, chat_payload(), Utc::now()).unwrap();

        let outcome = processor.process(id).unwrap();
        assert!(matches!(outcome, ProcessOutcome::Processed(s) if s.spans_inserted == 2));

        assert_eq!(store.get_batch(id).unwrap().status, BatchStatus::Processed);
        let trace_id: TraceId = TRACE_ID_HEX.parse().unwrap();
        let trace = store.find_trace(PROJECT, &trace_id).unwrap();
        assert_eq!(store.trace_spans(trace.id).len(), 2);
    }

    #[test]
    fn test_reprocessing_identical_bytes_adds_nothing() {
        let (store, processor) = setup();
        let first = store.create_batch(PROJECT, chat_payload(), Utc::now()).unwrap();
        let second = store.create_batch(PROJECT, chat_payload(), Utc::now()).unwrap();

        processor.process(first).unwrap();
        let after_first = store.counts();
        processor.process(second).unwrap();
        let after_second = store.counts();

        assert_eq!(after_first.traces, 1);
        assert_eq!(after_first.spans, 2);
        assert_eq!(after_first.traces, after_second.traces);
        assert_eq!(after_first.spans, after_second.spans);
        assert_eq!(store.get_batch(second).unwrap().status, BatchStatus::Processed);
    }

    #[test]
    fn test_invalid_protobuf_marks_error() {
        let (store, processor) = setup();
        let id = store
            .create_batch(PROJECT, b"definitely not protobuf \xff\xff".to_vec(), Utc::now())
            .unwrap();

        let err = processor.process(id).unwrap_err();
        assert!(matches!(err, WorkerError::Projection(ProjectionError::Decode(_))));

        let batch = store.get_batch(id).unwrap();
        assert_eq!(batch.status, BatchStatus::Error);
        assert!(batch.error_message.is_some());
        assert_eq!(store.counts().traces, 0);
        assert_eq!(store.counts().spans, 0);
    }

    #[test]
    fn test_empty_document_marks_error() {
        let (store, processor) = setup();
        let id = store
            .create_batch(PROJECT, request(vec![]).encode_to_vec(), Utc::now())
            .unwrap();

        assert!(matches!(
            processor.process(id),
            Err(WorkerError::NothingToProject)
        ));
        assert_eq!(store.get_batch(id).unwrap().status, BatchStatus::Error);
        assert_eq!(store.counts().traces, 0);
    }

    #[test]
    fn test_finished_batch_is_not_reprocessed() {
        let (store, processor) = setup();
        let id = store.create_batch(PROJECT, vec![0xff], Utc::now()).unwrap();
        assert!(processor.process(id).is_err());

        let outcome = processor.process(id).unwrap();
        assert_eq!(outcome, ProcessOutcome::AlreadyFinished(BatchStatus::Error));
        assert_eq!(store.get_batch(id).unwrap().status, BatchStatus::Error);
    }

    #[test]
    fn test_unknown_batch() {
        let (_, processor) = setup();
        assert!(matches!(
            processor.process(BatchId(404)),
            Err(WorkerError::Store(StoreError::BatchNotFound(_)))
        ));
    }

    /// Store whose commits fail a fixed number of times
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicUsize,
    }

    impl TraceStore for FlakyStore {
        fn create_batch(
            &self,
            project: ProjectId,
            payload: Vec<u8>,
            received_at: DateTime<Utc>,
        ) -> Result<BatchId, StoreError> {
            self.inner.create_batch(project, payload, received_at)
        }

        fn get_batch(&self, id: BatchId) -> Result<RawIngestedBatch, StoreError> {
            self.inner.get_batch(id)
        }

        fn finish_batch(
            &self,
            id: BatchId,
            status: BatchStatus,
            error_message: Option<String>,
        ) -> Result<(), StoreError> {
            self.inner.finish_batch(id, status, error_message)
        }

        fn pending_batches(&self) -> Vec<BatchId> {
            self.inner.pending_batches()
        }

        fn commit_projection(
            &self,
            project: ProjectId,
            trace: &ExtractedTrace,
            policy: DuplicateSpanPolicy,
        ) -> Result<CommitSummary, StoreError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("lock timeout".to_string()));
            }
            self.inner.commit_projection(project, trace, policy)
        }

        fn find_trace(&self, project: ProjectId, trace_id: &TraceId) -> Option<TraceRecord> {
            self.inner.find_trace(project, trace_id)
        }

        fn trace_spans(&self, trace: u64) -> Vec<SpanRecord> {
            self.inner.trace_spans(trace)
        }

        fn delete_project(&self, project: ProjectId) -> StoreCounts {
            self.inner.delete_project(project)
        }

        fn counts(&self) -> StoreCounts {
            self.inner.counts()
        }
    }

    fn flaky(failures: usize) -> Arc<FlakyStore> {
        Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures_left: AtomicUsize::new(failures),
        })
    }

    #[test]
    fn test_no_retry_marks_error_on_store_failure() {
        let store = flaky(1);
        let processor = BatchProcessor::new(store.clone());
        let id = store.create_batch(PROJECT, chat_payload(), Utc::now()).unwrap();

        assert!(matches!(processor.process(id), Err(WorkerError::Store(_))));
        assert_eq!(store.get_batch(id).unwrap().status, BatchStatus::Error);
        assert_eq!(store.counts().spans, 0);
    }

    #[test]
    fn test_retry_attempts_recover_from_store_failure() {
        let store = flaky(2);
        let processor =
            BatchProcessor::new(store.clone()).with_retry_policy(RetryPolicy::Attempts(3));
        let id = store.create_batch(PROJECT, chat_payload(), Utc::now()).unwrap();

        assert!(matches!(
            processor.process(id),
            Ok(ProcessOutcome::Processed(_))
        ));
        assert_eq!(store.get_batch(id).unwrap().status, BatchStatus::Processed);
        assert_eq!(store.counts().spans, 2);
    }

    #[test]
    fn test_requeue_pending() {
        let store = MemoryStore::new();
        let a = store.create_batch(PROJECT, vec![], Utc::now()).unwrap();
        let b = store.create_batch(PROJECT, vec![], Utc::now()).unwrap();
        store.finish_batch(a, BatchStatus::Error, None).unwrap();

        let (queue, _receiver) = channel();
        assert_eq!(requeue_pending(&store, &queue).unwrap(), 1);
        assert_eq!(queue.depth(), 1);
        assert_eq!(store.pending_batches(), vec![b]);
    }

    #[tokio::test]
    async fn test_pool_processes_enqueued_jobs() {
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(BatchProcessor::new(store.clone()));
        let (queue, receiver) = channel();
        let pool = Arc::new(WorkerPool::new(processor, receiver, 2));
        let handles = Arc::clone(&pool).start();

        let good = store.create_batch(PROJECT, chat_payload(), Utc::now()).unwrap();
        let bad = store.create_batch(PROJECT, vec![0xff], Utc::now()).unwrap();
        queue.enqueue(good).unwrap();
        queue.enqueue(bad).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !store.pending_batches().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(store.get_batch(good).unwrap().status, BatchStatus::Processed);
        assert_eq!(store.get_batch(bad).unwrap().status, BatchStatus::Error);

        pool.stop();
        drop(queue);
        for handle in handles {
            handle.await.unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 1);
        assert!(!pool.is_running());
    }
}
