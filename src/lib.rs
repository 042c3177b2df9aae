//! Tracehub: OTLP trace ingestion for AI/LLM applications
//!
//! Accepts OpenTelemetry trace exports over HTTP, stores each request body
//! untouched, and projects it asynchronously into per-project traces and
//! spans with normalized `gen_ai.*` call profiles.
//!
//! # Pipeline
//!
//! - **Ingest**: `POST /v1/traces` authenticates the API key, persists the raw
//!   protobuf as a pending batch and enqueues its id. No decoding on the
//!   request path.
//! - **Process**: workers decode the batch, project it into one trace with
//!   its spans and commit the result atomically. The batch ends `processed`
//!   or `error`.
//! - **Idempotency**: traces are unique per (project, trace id) and spans per
//!   (trace, span id), so redelivered or re-posted batches add nothing.
//!
//! # Example
//!
//! ```no_run
//! use tracehub::ingest::BatchProcessor;
//! use tracehub::storage::{MemoryStore, ProjectId, TraceStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let payload: Vec<u8> = std::fs::read("export.pb").unwrap();
//!
//! let batch = store
//!     .create_batch(ProjectId(1), payload, chrono::Utc::now())
//!     .unwrap();
//! let outcome = BatchProcessor::new(store.clone()).process(batch);
//! println!("{:?}", outcome);
//! ```

pub mod api;
pub mod ingest;
pub mod otel;
pub mod storage;

// Re-export commonly used types
pub use ingest::{BatchProcessor, JobQueue, RetryPolicy, WorkerError};
pub use otel::{extract_gen_ai, project, ExtractedTrace, GenAiFields, ProjectionError};
pub use storage::{DuplicateSpanPolicy, MemoryStore, StoreError, TraceStore};
