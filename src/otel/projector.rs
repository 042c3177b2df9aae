//! Projection of OTLP trace documents
//!
//! Walks `resource_spans -> scope_spans -> spans`, decoding identifiers,
//! timestamps and attributes, and folds the document into one
//! [`ExtractedTrace`]. Field-level problems are absorbed (the field is left
//! unset); only structural problems fail the document.

use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::trace::v1::Span;
use prost::Message;

use super::attributes::decode_attributes;
use super::genai::extract_gen_ai;
use super::model::{
    Attributes, ExtractedSpan, ExtractedTrace, SpanId, SpanKind, SpanStatus, TraceId,
};

const SERVICE_NAME: &str = "service.name";

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("invalid OTLP protobuf payload: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("no trace identifier could be resolved from the first span")]
    MissingTraceId,
}

/// Parse protobuf-encoded `ExportTraceServiceRequest` bytes
pub fn parse_trace_request(bytes: &[u8]) -> Result<ExportTraceServiceRequest, ProjectionError> {
    Ok(ExportTraceServiceRequest::decode(bytes)?)
}

/// Project one document into a trace and its spans.
///
/// Returns `Ok(None)` when the document has no resource-span groups.
/// `received_at` backs the trace bounds when no span carries a usable
/// start or end time.
pub fn project(
    request: &ExportTraceServiceRequest,
    received_at: DateTime<Utc>,
) -> Result<Option<ExtractedTrace>, ProjectionError> {
    if request.resource_spans.is_empty() {
        return Ok(None);
    }

    let mut resource_attributes = Attributes::new();
    // Outer None: no span seen yet. Inner None: first span's id was unusable.
    let mut trace_id: Option<Option<TraceId>> = None;
    let mut spans = Vec::new();

    for resource_spans in &request.resource_spans {
        let decoded = resource_spans
            .resource
            .as_ref()
            .map(|r| decode_attributes(&r.attributes))
            .unwrap_or_default();
        // last non-empty group wins, no merging
        if !decoded.is_empty() {
            resource_attributes = decoded;
        }

        for scope_spans in &resource_spans.scope_spans {
            for span in &scope_spans.spans {
                match trace_id {
                    None => trace_id = Some(TraceId::from_bytes(&span.trace_id)),
                    Some(Some(established)) if established.as_bytes()[..] != span.trace_id[..] => {
                        tracing::warn!(
                            trace_id = %established,
                            span_trace_id = %hex::encode(&span.trace_id),
                            "span carries a different trace id, attaching to the document's trace"
                        );
                    }
                    Some(_) => {}
                }

                match extract_span(span) {
                    Some(extracted) => spans.push(extracted),
                    None => tracing::warn!(
                        span_id = %hex::encode(&span.span_id),
                        name = %span.name,
                        "skipping span with malformed span id"
                    ),
                }
            }
        }
    }

    let trace_id = trace_id.flatten().ok_or(ProjectionError::MissingTraceId)?;
    let (start_time, end_time) = trace_bounds(&spans, received_at);
    let service_name = resource_attributes
        .get(SERVICE_NAME)
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(Some(ExtractedTrace {
        trace_id,
        resource_attributes,
        service_name,
        start_time,
        end_time,
        spans,
    }))
}

fn extract_span(span: &Span) -> Option<ExtractedSpan> {
    let span_id = SpanId::from_bytes(&span.span_id)?;
    let attributes = decode_attributes(&span.attributes);
    let gen_ai = extract_gen_ai(&attributes);
    let (status, status_message) = match &span.status {
        Some(status) => (
            SpanStatus::from_i32(status.code),
            Some(status.message.clone()).filter(|m| !m.is_empty()),
        ),
        None => (SpanStatus::Unset, None),
    };

    Some(ExtractedSpan {
        span_id,
        parent_span_id: SpanId::from_bytes(&span.parent_span_id),
        name: span.name.clone(),
        kind: SpanKind::from_i32(span.kind),
        status,
        status_message,
        start_time: nanos_to_datetime(span.start_time_unix_nano),
        end_time: nanos_to_datetime(span.end_time_unix_nano),
        attributes,
        gen_ai,
    })
}

/// Epoch nanoseconds to a UTC timestamp; zero means unset in OTLP
pub fn nanos_to_datetime(nanos: u64) -> Option<DateTime<Utc>> {
    if nanos == 0 {
        return None;
    }
    let secs = (nanos / 1_000_000_000) as i64;
    let subsec = (nanos % 1_000_000_000) as u32;
    DateTime::from_timestamp(secs, subsec)
}

/// min of resolved starts and max of resolved ends, each falling back to
/// `fallback` independently
pub fn trace_bounds(
    spans: &[ExtractedSpan],
    fallback: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = spans
        .iter()
        .filter_map(|s| s.start_time)
        .min()
        .unwrap_or(fallback);
    let end = spans
        .iter()
        .filter_map(|s| s.end_time)
        .max()
        .unwrap_or(fallback);
    (start, end)
}
