use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::auth::{ApiKeyResolver, ProjectAuth};
use crate::ingest::{JobQueue, WorkerPool, WorkerStatsSnapshot};
use crate::otel::model::InvalidId;
use crate::otel::{Attributes, TraceId};
use crate::storage::{BatchId, BatchStatus, SpanRecord, StoreCounts, TraceStore};

/// Content types accepted by the ingestion endpoint
const PROTOBUF_CONTENT_TYPES: [&str; 2] = ["application/x-protobuf", "application/protobuf"];

/// Application state shared across handlers
pub struct AppState {
    pub store: Arc<dyn TraceStore>,
    pub queue: Arc<dyn JobQueue>,
    pub keys: Arc<dyn ApiKeyResolver>,
    pub workers: Option<Arc<WorkerPool>>,
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Ingest
// ============================================================================

/// `POST /v1/traces`: store the raw OTLP body and queue it for processing.
///
/// No decoding happens here; a malformed body is only discovered by the
/// worker and shows up as an `error` batch.
pub async fn ingest_traces(
    State(state): State<Arc<AppState>>,
    ProjectAuth(project): ProjectAuth,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !is_protobuf(content_type) {
        return Err(ApiError::BadRequest(format!(
            "Unsupported content type '{}', expected application/x-protobuf",
            content_type
        )));
    }

    let id = state
        .store
        .create_batch(project, body.to_vec(), Utc::now())
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    // the batch stays pending and is picked up again on restart
    state.queue.enqueue(id).map_err(|e| {
        tracing::error!(batch = %id, "Failed to enqueue batch: {}", e);
        ApiError::Unavailable(e.to_string())
    })?;

    tracing::debug!(batch = %id, project = %project, bytes = body.len(), "Batch accepted");
    Ok((StatusCode::CREATED, Json(serde_json::json!({}))))
}

fn is_protobuf(content_type: &str) -> bool {
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    PROTOBUF_CONTENT_TYPES
        .iter()
        .any(|accepted| media_type.eq_ignore_ascii_case(accepted))
}

// ============================================================================
// Lookups
// ============================================================================

#[derive(Serialize)]
pub struct BatchStatusResponse {
    pub id: BatchId,
    pub status: BatchStatus,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub size_bytes: usize,
}

pub async fn batch_status(
    State(state): State<Arc<AppState>>,
    ProjectAuth(project): ProjectAuth,
    Path(id): Path<u64>,
) -> Result<Json<BatchStatusResponse>, ApiError> {
    let id = BatchId(id);
    let not_found = || ApiError::NotFound(format!("Batch {} not found", id));

    let batch = state.store.get_batch(id).map_err(|_| not_found())?;
    if batch.project_id != project {
        return Err(not_found());
    }

    Ok(Json(BatchStatusResponse {
        id: batch.id,
        status: batch.status,
        received_at: batch.received_at,
        processed_at: batch.processed_at,
        error_message: batch.error_message,
        size_bytes: batch.payload.len(),
    }))
}

#[derive(Serialize)]
pub struct TraceDetailResponse {
    pub trace_id: String,
    pub service_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub attributes: Attributes,
    pub span_count: usize,
    pub spans: Vec<SpanView>,
}

#[derive(Serialize)]
pub struct SpanView {
    #[serde(flatten)]
    pub span: SpanRecord,
    pub duration_ms: Option<i64>,
}

pub async fn trace_detail(
    State(state): State<Arc<AppState>>,
    ProjectAuth(project): ProjectAuth,
    Path(trace_id): Path<String>,
) -> Result<Json<TraceDetailResponse>, ApiError> {
    let parsed: TraceId = trace_id
        .to_ascii_lowercase()
        .parse()
        .map_err(|e: InvalidId| ApiError::BadRequest(e.to_string()))?;

    let trace = state
        .store
        .find_trace(project, &parsed)
        .ok_or_else(|| ApiError::NotFound(format!("Trace {} not found", trace_id)))?;

    let spans: Vec<SpanView> = state
        .store
        .trace_spans(trace.id)
        .into_iter()
        .map(|span| SpanView {
            duration_ms: span.duration_ms(),
            span,
        })
        .collect();

    Ok(Json(TraceDetailResponse {
        duration_ms: trace.duration_ms(),
        trace_id: trace.trace_id,
        service_name: trace.service_name,
        start_time: trace.start_time,
        end_time: trace.end_time,
        attributes: trace.attributes,
        span_count: spans.len(),
        spans,
    }))
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub counts: StoreCounts,
    pub pending_batches: usize,
    pub workers: Option<WorkerStatsSnapshot>,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        counts: state.store.counts(),
        pending_batches: state.store.pending_batches().len(),
        workers: state.workers.as_ref().map(|w| w.stats()),
    })
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
