//! Persisted record types
//!
//! Identifiers are stored as lowercase hex strings; this is the boundary
//! where binary ids from [`crate::otel`] get formatted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::otel::model::hex_bytes;
use crate::otel::{Attributes, ExtractedSpan, GenAiFields, SpanKind, SpanStatus};

/// Owning project, resolved by API-key authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub i64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row id of a raw ingested batch; also the job id handed to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Processing status of a raw batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processed,
    Error,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processed => "processed",
            BatchStatus::Error => "error",
        }
    }

    /// Only pending -> processed and pending -> error are legal
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (BatchStatus::Pending, BatchStatus::Processed) | (BatchStatus::Pending, BatchStatus::Error)
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accepted ingestion request, kept for audit and replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawIngestedBatch {
    pub id: BatchId,
    pub project_id: ProjectId,
    /// Protobuf bytes exactly as received
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

/// One logical distributed trace, unique per (project, trace_id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub id: u64,
    pub project_id: ProjectId,
    pub trace_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub service_name: Option<String>,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One span, unique per (trace, span_id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub id: u64,
    /// Row id of the owning [`TraceRecord`]
    pub trace: u64,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub status: SpanStatus,
    pub status_message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub attributes: Attributes,
    /// Present only for spans that carried recognized gen-AI keys
    pub gen_ai: Option<GenAiFields>,
}

impl SpanRecord {
    pub fn from_extracted(id: u64, trace: u64, span: &ExtractedSpan) -> Self {
        Self {
            id,
            trace,
            span_id: span.span_id.to_hex(),
            parent_span_id: span.parent_span_id.map(|p| p.to_hex()),
            name: span.name.clone(),
            kind: span.kind,
            status: span.status,
            status_message: span.status_message.clone(),
            start_time: span.start_time,
            end_time: span.end_time,
            attributes: span.attributes.clone(),
            gen_ai: Some(span.gen_ai.clone()).filter(|g| !g.is_empty()),
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        duration_ms(self.start_time?, self.end_time?)
    }
}

impl TraceRecord {
    pub fn duration_ms(&self) -> Option<i64> {
        duration_ms(self.start_time, self.end_time)
    }
}

fn duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<i64> {
    let ms = (end - start).num_milliseconds();
    (ms >= 0).then_some(ms)
}
