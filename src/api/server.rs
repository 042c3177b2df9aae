use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::auth::{ApiKeyEntry, InvalidKeySpec, StaticApiKeys};
use super::handlers::{batch_status, health_check, ingest_traces, stats, trace_detail, AppState};
use crate::ingest::{channel, requeue_pending, BatchProcessor, RetryPolicy, WorkerPool};
use crate::storage::{DuplicateSpanPolicy, MemoryStore, SnapshotManager, SnapshotWorker, TraceStore};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub max_body_bytes: usize,
    /// Snapshot directory; the store is memory-only when unset
    pub data_dir: Option<PathBuf>,
    pub snapshot_interval_secs: u64,
    pub api_keys: Vec<ApiKeyEntry>,
    pub duplicate_spans: DuplicateSpanPolicy,
    pub retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4318,
            workers: num_cpus::get().max(1),
            max_body_bytes: 16 * 1024 * 1024, // 16MB
            data_dir: None,
            snapshot_interval_secs: 30,
            api_keys: Vec::new(),
            duplicate_spans: DuplicateSpanPolicy::Ignore,
            retry: RetryPolicy::None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0}")]
    ApiKeys(#[from] InvalidKeySpec),

    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
}

impl ServerConfig {
    /// Read `TRACEHUB_*` variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let duplicate_spans = match lookup("TRACEHUB_DUPLICATE_SPANS").as_deref() {
            None | Some("ignore") => DuplicateSpanPolicy::Ignore,
            Some("replace") => DuplicateSpanPolicy::Replace,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    name: "TRACEHUB_DUPLICATE_SPANS",
                    value: other.to_string(),
                })
            }
        };

        let retry = match parse_var::<u32, _>(&lookup, "TRACEHUB_RETRY_ATTEMPTS") {
            Some(n) if n > 1 => RetryPolicy::Attempts(n),
            _ => RetryPolicy::None,
        };

        Ok(Self {
            host: lookup("TRACEHUB_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "TRACEHUB_PORT").unwrap_or(defaults.port),
            workers: parse_var(&lookup, "TRACEHUB_WORKERS")
                .map(|n: usize| n.max(1))
                .unwrap_or(defaults.workers),
            max_body_bytes: parse_var(&lookup, "TRACEHUB_MAX_BODY_BYTES")
                .unwrap_or(defaults.max_body_bytes),
            data_dir: lookup("TRACEHUB_DATA_DIR")
                .filter(|d| !d.trim().is_empty())
                .map(PathBuf::from),
            snapshot_interval_secs: parse_var(&lookup, "TRACEHUB_SNAPSHOT_INTERVAL_SECS")
                .filter(|&s: &u64| s > 0)
                .unwrap_or(defaults.snapshot_interval_secs),
            api_keys: lookup("TRACEHUB_API_KEYS")
                .map(|spec| ApiKeyEntry::parse_list(&spec))
                .transpose()?
                .unwrap_or_default(),
            duplicate_spans,
            retry,
        })
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(name).and_then(|v| v.trim().parse().ok())
}

/// Build the application router
pub fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // OTLP/HTTP ingestion
        .route("/v1/traces", post(ingest_traces))
        // Lookups
        .route("/v1/traces/:trace_id", get(trace_detail))
        .route("/v1/batches/:id", get(batch_status))
        // Stats
        .route("/stats", get(stats))
        // Middleware
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Restore the store from the last snapshot, if persistence is enabled
    let snapshots = match &config.data_dir {
        Some(dir) => Some(Arc::new(SnapshotManager::new(dir)?)),
        None => {
            tracing::warn!("No data directory configured, batches will not survive restarts");
            None
        }
    };
    let store = match snapshots.as_ref().map(|m| m.restore()).transpose()?.flatten() {
        Some(restored) => Arc::new(restored),
        None => Arc::new(MemoryStore::new()),
    };
    let dyn_store: Arc<dyn TraceStore> = Arc::clone(&store) as Arc<dyn TraceStore>;

    // Start batch workers
    let (queue, receiver) = channel();
    let processor = Arc::new(
        BatchProcessor::new(Arc::clone(&dyn_store))
            .with_duplicate_policy(config.duplicate_spans)
            .with_retry_policy(config.retry),
    );
    let pool = Arc::new(WorkerPool::new(processor, receiver, config.workers));
    let worker_handles = Arc::clone(&pool).start();
    requeue_pending(dyn_store.as_ref(), &queue)?;

    // Start snapshot worker
    let snapshot_worker = snapshots.map(|manager| {
        Arc::new(SnapshotWorker::new(
            Arc::clone(&store),
            manager,
            Duration::from_secs(config.snapshot_interval_secs),
        ))
    });
    let snapshot_handle = snapshot_worker.as_ref().map(|w| Arc::clone(w).start());

    let keys = StaticApiKeys::from_entries(&config.api_keys);
    if keys.is_empty() {
        tracing::warn!("No API keys configured, every ingest request will be rejected");
    }

    let state = Arc::new(AppState {
        store: dyn_store,
        queue: Arc::new(queue),
        keys: Arc::new(keys),
        workers: Some(Arc::clone(&pool)),
    });

    // Build router
    let app = build_router(state, config.max_body_bytes);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Starting Tracehub server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&pool), snapshot_worker.clone()))
        .await?;

    // Queued batches stay pending and are re-enqueued after restart
    for handle in worker_handles {
        handle.abort();
    }
    if let Some(worker) = &snapshot_worker {
        worker.save_now();
    }
    if let Some(handle) = snapshot_handle {
        handle.abort();
    }

    let stats = pool.stats();
    tracing::info!(
        processed = stats.processed,
        failed = stats.failed,
        "Tracehub server stopped"
    );
    Ok(())
}

async fn shutdown_signal(pool: Arc<WorkerPool>, snapshot_worker: Option<Arc<SnapshotWorker>>) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");

    tracing::info!("Shutdown signal received, stopping workers...");
    pool.stop();
    if let Some(worker) = snapshot_worker {
        worker.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{JobReceiver, ProcessOutcome};
    use crate::otel::testing::{chat_payload, TRACE_ID_HEX};
    use crate::storage::{BatchStatus, ProjectId};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::response::Response;
    use chrono::Utc;
    use std::collections::HashMap;
    use tower::util::ServiceExt;

    const KEY: &str = "test-key";
    const PROJECT: ProjectId = ProjectId(1);

    struct TestApp {
        router: Router,
        store: Arc<MemoryStore>,
        receiver: JobReceiver,
    }

    fn create_test_app() -> TestApp {
        let store = Arc::new(MemoryStore::new());
        let (queue, receiver) = channel();
        let keys = StaticApiKeys::new();
        keys.insert(PROJECT, KEY);
        keys.insert(ProjectId(2), "other-key");

        let state = Arc::new(AppState {
            store: Arc::clone(&store) as Arc<dyn TraceStore>,
            queue: Arc::new(queue),
            keys: Arc::new(keys),
            workers: None,
        });
        TestApp {
            router: build_router(state, 1024 * 1024),
            store,
            receiver,
        }
    }

    fn post_traces(key: Option<&str>, content_type: &str, body: Vec<u8>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/traces")
            .header(header::CONTENT_TYPE, content_type);
        if let Some(key) = key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn get_request(uri: &str, key: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", key))
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_test_app();

        let response = app
            .router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ingest_stores_and_enqueues() {
        let app = create_test_app();

        let response = app
            .router
            .oneshot(post_traces(Some(KEY), "application/x-protobuf", chat_payload()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await, serde_json::json!({}));

        let id = app.receiver.next().await.unwrap();
        let batch = app.store.get_batch(id).unwrap();
        assert_eq!(batch.project_id, PROJECT);
        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(batch.payload, chat_payload());
    }

    #[tokio::test]
    async fn test_ingest_does_not_decode() {
        let app = create_test_app();

        let response = app
            .router
            .oneshot(post_traces(Some(KEY), "application/protobuf", b"garbage".to_vec()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(app.store.pending_batches().len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_rejects_json_content_type() {
        let app = create_test_app();

        let response = app
            .router
            .oneshot(post_traces(Some(KEY), "application/json", b"{}".to_vec()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("application/json"));
        assert_eq!(app.store.counts().batches, 0);
        assert_eq!(app.receiver.depth(), 0);
    }

    #[tokio::test]
    async fn test_ingest_requires_api_key() {
        let app = create_test_app();

        let missing = app
            .router
            .clone()
            .oneshot(post_traces(None, "application/x-protobuf", chat_payload()))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert!(json_body(missing).await["error"].is_string());

        let wrong = app
            .router
            .oneshot(post_traces(Some("nope"), "application/x-protobuf", chat_payload()))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(app.store.counts().batches, 0);
    }

    #[tokio::test]
    async fn test_ingest_rejects_other_methods() {
        let app = create_test_app();

        let response = app.router.oneshot(get_request("/v1/traces", KEY)).await.unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_ingest_body_limit() {
        let app = create_test_app();

        let response = app
            .router
            .oneshot(post_traces(
                Some(KEY),
                "application/x-protobuf",
                vec![0u8; 2 * 1024 * 1024],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(app.store.counts().batches, 0);
    }

    #[tokio::test]
    async fn test_batch_status_lookup() {
        let app = create_test_app();
        let id = app
            .store
            .create_batch(PROJECT, chat_payload(), Utc::now())
            .unwrap();

        let pending = app
            .router
            .clone()
            .oneshot(get_request(&format!("/v1/batches/{}", id), KEY))
            .await
            .unwrap();
        assert_eq!(pending.status(), StatusCode::OK);
        assert_eq!(json_body(pending).await["status"], "pending");

        let processor = BatchProcessor::new(Arc::clone(&app.store) as Arc<dyn TraceStore>);
        assert!(matches!(
            processor.process(id),
            Ok(ProcessOutcome::Processed(_))
        ));

        let processed = app
            .router
            .clone()
            .oneshot(get_request(&format!("/v1/batches/{}", id), KEY))
            .await
            .unwrap();
        let body = json_body(processed).await;
        assert_eq!(body["status"], "processed");
        assert!(body["processed_at"].is_string());

        // another project's batch is invisible
        let foreign = app
            .router
            .oneshot(get_request(&format!("/v1/batches/{}", id), "other-key"))
            .await
            .unwrap();
        assert_eq!(foreign.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_trace_detail() {
        let app = create_test_app();
        let id = app
            .store
            .create_batch(PROJECT, chat_payload(), Utc::now())
            .unwrap();
        BatchProcessor::new(Arc::clone(&app.store) as Arc<dyn TraceStore>)
            .process(id)
            .unwrap();

        let response = app
            .router
            .clone()
            .oneshot(get_request(&format!("/v1/traces/{}", TRACE_ID_HEX), KEY))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["trace_id"], TRACE_ID_HEX);
        assert_eq!(body["service_name"], "support-bot");
        assert_eq!(body["span_count"], 2);
        let names: Vec<&str> = body["spans"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["agent.run", "chat gpt-4o"]);
        assert_eq!(body["spans"][1]["gen_ai"]["input_tokens"], 120);

        let foreign = app
            .router
            .oneshot(get_request(&format!("/v1/traces/{}", TRACE_ID_HEX), "other-key"))
            .await
            .unwrap();
        assert_eq!(foreign.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_trace_detail_rejects_bad_id() {
        let app = create_test_app();

        let response = app
            .router
            .oneshot(get_request("/v1/traces/not-hex", KEY))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stats() {
        let app = create_test_app();
        app.store
            .create_batch(PROJECT, vec![], Utc::now())
            .unwrap();

        let response = app
            .router
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = json_body(response).await;
        assert_eq!(body["batches"], 1);
        assert_eq!(body["pending_batches"], 1);
        assert!(body["workers"].is_null());
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("TRACEHUB_PORT", "9000"),
            ("TRACEHUB_WORKERS", "0"),
            ("TRACEHUB_DATA_DIR", "/var/lib/tracehub"),
            ("TRACEHUB_API_KEYS", "1:alpha,2:beta"),
            ("TRACEHUB_DUPLICATE_SPANS", "replace"),
            ("TRACEHUB_RETRY_ATTEMPTS", "3"),
        ]
        .into_iter()
        .collect();

        let config =
            ServerConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.workers, 1);
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/tracehub")));
        assert_eq!(config.snapshot_interval_secs, 30);
        assert_eq!(config.api_keys.len(), 2);
        assert_eq!(config.duplicate_spans, DuplicateSpanPolicy::Replace);
        assert_eq!(config.retry, RetryPolicy::Attempts(3));
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let bad_keys = ServerConfig::from_lookup(|name| {
            (name == "TRACEHUB_API_KEYS").then(|| "alpha".to_string())
        });
        assert!(matches!(bad_keys, Err(ConfigError::ApiKeys(_))));

        let bad_policy = ServerConfig::from_lookup(|name| {
            (name == "TRACEHUB_DUPLICATE_SPANS").then(|| "merge".to_string())
        });
        assert!(matches!(bad_policy, Err(ConfigError::InvalidValue { .. })));
    }
}
