//! Tracehub Server
//!
//! Run with: cargo run
//!
//! Environment variables:
//! - TRACEHUB_HOST: Bind address (default: 0.0.0.0)
//! - TRACEHUB_PORT: Port number (default: 4318, the OTLP/HTTP port)
//! - TRACEHUB_WORKERS: Batch worker count (default: number of CPUs)
//! - TRACEHUB_MAX_BODY_BYTES: Request body limit (default: 16 MiB)
//! - TRACEHUB_DATA_DIR: Snapshot directory (default: unset, memory only)
//! - TRACEHUB_SNAPSHOT_INTERVAL_SECS: Snapshot interval (default: 30)
//! - TRACEHUB_API_KEYS: Comma-separated `project_id:key` pairs
//! - TRACEHUB_DUPLICATE_SPANS: `ignore` or `replace` (default: ignore)
//! - TRACEHUB_RETRY_ATTEMPTS: Commit attempts per batch (default: 1)
//! - RUST_LOG: Log level (default: info)

use tracehub::api::{run_server, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tracehub=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;

    tracing::info!("Tracehub configuration:");
    tracing::info!("  Host: {}:{}", config.host, config.port);
    tracing::info!("  Workers: {}", config.workers);
    tracing::info!(
        "  Max body size: {} MB",
        config.max_body_bytes / (1024 * 1024)
    );
    match &config.data_dir {
        Some(dir) => tracing::info!(
            "  Snapshots: {} every {} seconds",
            dir.display(),
            config.snapshot_interval_secs
        ),
        None => tracing::info!("  Snapshots: DISABLED (memory only)"),
    }
    tracing::info!("  API keys: {}", config.api_keys.len());
    tracing::info!("  Duplicate spans: {:?}", config.duplicate_spans);
    tracing::info!("  Retry policy: {:?}", config.retry);

    println!(
        r#"
  _                          _           _
 | |_  _ __  __ _   ___  ___| |__  _   _| |__
 | __|| '__|/ _` | / __|/ _ \ '_ \| | | | '_ \
 | |_ | |  | (_| || (__|  __/ | | | |_| | |_) |
  \__||_|   \__,_| \___|\___|_| |_|\__,_|_.__/

 OTLP Trace Ingestion for AI Applications
 Version: {}
"#,
        env!("CARGO_PKG_VERSION")
    );

    run_server(config).await
}
