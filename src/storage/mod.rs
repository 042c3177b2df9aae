pub mod models;
pub mod snapshot;
pub mod store;

pub use models::{BatchId, BatchStatus, ProjectId, RawIngestedBatch, SpanRecord, TraceRecord};
pub use snapshot::{PersistenceError, SnapshotManager, SnapshotMetadata, SnapshotWorker};
pub use store::{
    CommitSummary, DuplicateSpanPolicy, MemoryStore, StoreCounts, StoreError, StoreSnapshot,
    TraceStore,
};
