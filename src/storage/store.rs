use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::models::{
    BatchId, BatchStatus, ProjectId, RawIngestedBatch, SpanRecord, TraceRecord,
};
use crate::otel::{ExtractedTrace, TraceId};

/// What to do when a span's (trace, span_id) already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicateSpanPolicy {
    /// Keep the stored row, discard the new one
    #[default]
    Ignore,
    /// Overwrite the stored row in place, keeping its row id
    Replace,
}

/// Result of persisting one projected trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    /// Row id of the upserted trace
    pub trace: u64,
    pub trace_created: bool,
    pub spans_inserted: usize,
    pub spans_replaced: usize,
    pub spans_skipped: usize,
}

/// Row counts, mostly for tests and stats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub batches: usize,
    pub traces: usize,
    pub spans: usize,
}

/// Persistence seam for the ingestion pipeline.
///
/// Implementations must make [`TraceStore::commit_projection`] atomic and
/// enforce (project, trace_id) and (trace, span_id) uniqueness themselves.
pub trait TraceStore: Send + Sync {
    fn create_batch(
        &self,
        project: ProjectId,
        payload: Vec<u8>,
        received_at: DateTime<Utc>,
    ) -> Result<BatchId, StoreError>;

    fn get_batch(&self, id: BatchId) -> Result<RawIngestedBatch, StoreError>;

    /// Terminal status write for a pending batch
    fn finish_batch(
        &self,
        id: BatchId,
        status: BatchStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;

    /// Ids of batches still waiting for processing, oldest first
    fn pending_batches(&self) -> Vec<BatchId>;

    /// Upsert the trace and insert its spans in one transaction
    fn commit_projection(
        &self,
        project: ProjectId,
        trace: &ExtractedTrace,
        policy: DuplicateSpanPolicy,
    ) -> Result<CommitSummary, StoreError>;

    fn find_trace(&self, project: ProjectId, trace_id: &TraceId) -> Option<TraceRecord>;

    /// Spans of a trace ordered by start time (unset first)
    fn trace_spans(&self, trace: u64) -> Vec<SpanRecord>;

    /// Cascade delete of everything a project owns
    fn delete_project(&self, project: ProjectId) -> StoreCounts;

    fn counts(&self) -> StoreCounts;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Batch {0} not found")]
    BatchNotFound(BatchId),

    #[error("Batch {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: BatchId,
        from: BatchStatus,
        to: BatchStatus,
    },

    /// Transient backend failure (lock timeout, lost connection). Never
    /// raised by [`MemoryStore`]; retried under `RetryPolicy::Attempts`.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Serializable image of a [`MemoryStore`]
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub batches: Vec<RawIngestedBatch>,
    pub traces: Vec<TraceRecord>,
    pub spans: Vec<SpanRecord>,
}

#[derive(Default)]
struct Tables {
    next_batch: u64,
    next_trace: u64,
    next_span: u64,
    batches: BTreeMap<BatchId, RawIngestedBatch>,
    traces: BTreeMap<u64, TraceRecord>,
    spans: BTreeMap<u64, SpanRecord>,
    // unique indexes
    trace_index: HashMap<(ProjectId, String), u64>,
    span_index: HashMap<(u64, String), u64>,
    // trace row -> span rows
    trace_children: HashMap<u64, BTreeSet<u64>>,
}

impl Tables {
    fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut tables = Tables::default();
        for batch in snapshot.batches {
            tables.next_batch = tables.next_batch.max(batch.id.0);
            tables.batches.insert(batch.id, batch);
        }
        for trace in snapshot.traces {
            tables.next_trace = tables.next_trace.max(trace.id);
            tables
                .trace_index
                .insert((trace.project_id, trace.trace_id.clone()), trace.id);
            tables.traces.insert(trace.id, trace);
        }
        for span in snapshot.spans {
            tables.next_span = tables.next_span.max(span.id);
            tables
                .span_index
                .insert((span.trace, span.span_id.clone()), span.id);
            tables.trace_children.entry(span.trace).or_default().insert(span.id);
            tables.spans.insert(span.id, span);
        }
        tables
    }

    fn children(&self, trace: u64) -> impl Iterator<Item = &SpanRecord> {
        self.trace_children
            .get(&trace)
            .into_iter()
            .flatten()
            .filter_map(|row| self.spans.get(row))
    }
}

/// In-memory relational store guarded by a single lock; one write-lock
/// critical section is one transaction.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            tables: RwLock::new(Tables::from_snapshot(snapshot)),
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let tables = self.tables.read();
        StoreSnapshot {
            batches: tables.batches.values().cloned().collect(),
            traces: tables.traces.values().cloned().collect(),
            spans: tables.spans.values().cloned().collect(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceStore for MemoryStore {
    fn create_batch(
        &self,
        project: ProjectId,
        payload: Vec<u8>,
        received_at: DateTime<Utc>,
    ) -> Result<BatchId, StoreError> {
        let mut tables = self.tables.write();
        tables.next_batch += 1;
        let id = BatchId(tables.next_batch);
        tables.batches.insert(
            id,
            RawIngestedBatch {
                id,
                project_id: project,
                payload,
                received_at,
                status: BatchStatus::Pending,
                error_message: None,
                processed_at: None,
            },
        );
        Ok(id)
    }

    fn get_batch(&self, id: BatchId) -> Result<RawIngestedBatch, StoreError> {
        self.tables
            .read()
            .batches
            .get(&id)
            .cloned()
            .ok_or(StoreError::BatchNotFound(id))
    }

    fn finish_batch(
        &self,
        id: BatchId,
        status: BatchStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let batch = tables
            .batches
            .get_mut(&id)
            .ok_or(StoreError::BatchNotFound(id))?;

        if !batch.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: batch.status,
                to: status,
            });
        }

        batch.status = status;
        batch.error_message = error_message;
        batch.processed_at = Some(Utc::now());
        Ok(())
    }

    fn pending_batches(&self) -> Vec<BatchId> {
        self.tables
            .read()
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Pending)
            .map(|b| b.id)
            .collect()
    }

    fn commit_projection(
        &self,
        project: ProjectId,
        trace: &ExtractedTrace,
        policy: DuplicateSpanPolicy,
    ) -> Result<CommitSummary, StoreError> {
        let now = Utc::now();
        let trace_key = (project, trace.trace_id.to_hex());

        let mut tables = self.tables.write();
        let tables = &mut *tables;

        // Trace upsert
        let (trace_row, trace_created) = match tables.trace_index.get(&trace_key) {
            Some(&row) => {
                if let Some(existing) = tables.traces.get_mut(&row) {
                    if !trace.resource_attributes.is_empty() {
                        existing.attributes = trace.resource_attributes.clone();
                        existing.service_name = trace.service_name.clone();
                    }
                    existing.updated_at = now;
                }
                (row, false)
            }
            None => {
                tables.next_trace += 1;
                let row = tables.next_trace;
                tables.traces.insert(
                    row,
                    TraceRecord {
                        id: row,
                        project_id: project,
                        trace_id: trace_key.1.clone(),
                        start_time: trace.start_time,
                        end_time: trace.end_time,
                        service_name: trace.service_name.clone(),
                        attributes: trace.resource_attributes.clone(),
                        created_at: now,
                        updated_at: now,
                    },
                );
                tables.trace_index.insert(trace_key, row);
                (row, true)
            }
        };

        // Span insert with conflict handling on (trace, span_id)
        let mut summary = CommitSummary {
            trace: trace_row,
            trace_created,
            spans_inserted: 0,
            spans_replaced: 0,
            spans_skipped: 0,
        };
        for span in &trace.spans {
            let span_key = (trace_row, span.span_id.to_hex());
            match (tables.span_index.get(&span_key).copied(), policy) {
                (Some(_), DuplicateSpanPolicy::Ignore) => summary.spans_skipped += 1,
                (Some(row), DuplicateSpanPolicy::Replace) => {
                    tables
                        .spans
                        .insert(row, SpanRecord::from_extracted(row, trace_row, span));
                    summary.spans_replaced += 1;
                }
                (None, _) => {
                    tables.next_span += 1;
                    let row = tables.next_span;
                    tables
                        .spans
                        .insert(row, SpanRecord::from_extracted(row, trace_row, span));
                    tables.span_index.insert(span_key, row);
                    tables.trace_children.entry(trace_row).or_default().insert(row);
                    summary.spans_inserted += 1;
                }
            }
        }

        // Fresh min/max over every current child of the trace; without any
        // child timestamp the row keeps the bounds it already has
        let start = tables.children(trace_row).filter_map(|s| s.start_time).min();
        let end = tables.children(trace_row).filter_map(|s| s.end_time).max();
        if let Some(record) = tables.traces.get_mut(&trace_row) {
            if let Some(start) = start {
                record.start_time = start;
            }
            if let Some(end) = end {
                record.end_time = end;
            }
        }

        Ok(summary)
    }

    fn find_trace(&self, project: ProjectId, trace_id: &TraceId) -> Option<TraceRecord> {
        let tables = self.tables.read();
        let row = tables.trace_index.get(&(project, trace_id.to_hex()))?;
        tables.traces.get(row).cloned()
    }

    fn trace_spans(&self, trace: u64) -> Vec<SpanRecord> {
        let tables = self.tables.read();
        let mut spans: Vec<SpanRecord> = tables.children(trace).cloned().collect();
        spans.sort_by_key(|s| (s.start_time, s.id));
        spans
    }

    fn delete_project(&self, project: ProjectId) -> StoreCounts {
        let mut tables = self.tables.write();
        let tables = &mut *tables;

        let before_batches = tables.batches.len();
        tables.batches.retain(|_, b| b.project_id != project);

        let owned: HashSet<u64> = tables
            .traces
            .values()
            .filter(|t| t.project_id == project)
            .map(|t| t.id)
            .collect();
        let mut spans_removed = 0;
        for row in &owned {
            tables.traces.remove(row);
            for span_row in tables.trace_children.remove(row).unwrap_or_default() {
                if let Some(span) = tables.spans.remove(&span_row) {
                    tables.span_index.remove(&(*row, span.span_id));
                    spans_removed += 1;
                }
            }
        }
        tables.trace_index.retain(|(p, _), _| *p != project);

        StoreCounts {
            batches: before_batches - tables.batches.len(),
            traces: owned.len(),
            spans: spans_removed,
        }
    }

    fn counts(&self) -> StoreCounts {
        let tables = self.tables.read();
        StoreCounts {
            batches: tables.batches.len(),
            traces: tables.traces.len(),
            spans: tables.spans.len(),
        }
    }
}
