//! AgriGate Outbox Relay
//!
//! Reads lifecycle notifications staged in the case database outbox and
//! publishes them to the downstream application-lifecycle queue. Runs
//! separately from the intake worker so a queue outage never blocks case
//! creation. Supports SQLite and PostgreSQL outbox stores.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `AG_DB_TYPE` | `postgres` | Database type: `sqlite`, `postgres` |
//! | `AG_DATABASE_URL` | - | Database connection URL (required) |
//! | `AG_LIFECYCLE_QUEUE_URL` | - | SQS queue for lifecycle notifications (required) |
//! | `AG_RELAY_POLL_INTERVAL_MS` | `1000` | Poll interval in milliseconds |
//! | `AG_RELAY_BATCH_SIZE` | `50` | Max outbox rows per batch |
//! | `AG_RELAY_MAX_RETRIES` | `5` | Publish attempts before a row stays failed |
//! | `AG_RELAY_STUCK_TIMEOUT_SECS` | `300` | Age at which a processing row is recovered |
//! | `AG_METRICS_PORT` | `9091` | Metrics/health port |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_sqs::types::MessageAttributeValue;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ag_common::OutboxRecord;
use ag_outbox::{LifecyclePublisher, OutboxRelay, RelayConfig};
use ag_store::OutboxStore;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable is required", key))
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting AgriGate Outbox Relay");

    // 2. Configuration
    let db_type = env_or("AG_DB_TYPE", "postgres");
    let queue_url = env_required("AG_LIFECYCLE_QUEUE_URL")?;
    let relay_config = RelayConfig {
        poll_interval: Duration::from_millis(env_or_parse("AG_RELAY_POLL_INTERVAL_MS", 1000)),
        batch_size: env_or_parse("AG_RELAY_BATCH_SIZE", 50),
        max_retries: env_or_parse("AG_RELAY_MAX_RETRIES", 5),
        stuck_timeout: Duration::from_secs(env_or_parse("AG_RELAY_STUCK_TIMEOUT_SECS", 300)),
        ..RelayConfig::default()
    };
    let metrics_port: u16 = env_or_parse("AG_METRICS_PORT", 9091);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // 3. Metrics recorder
    let metrics_handle = PrometheusBuilder::new().install_recorder()?;

    // 4. Outbox store
    let store = create_outbox_store(&db_type).await?;
    info!("Outbox store initialized ({})", db_type);

    // 5. SQS publisher
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let sqs_client = aws_sdk_sqs::Client::new(&aws_config);
    let publisher = Arc::new(SqsLifecyclePublisher::new(sqs_client, queue_url.clone()));
    info!("Lifecycle queue: {}", queue_url);

    // 6. Relay loop
    let relay = Arc::new(OutboxRelay::new(store, publisher, relay_config));
    let relay_handle = {
        let relay = relay.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { relay.start(shutdown_rx).await })
    };

    // 7. Ops server
    let ops_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    info!("Ops server listening on http://{}/metrics", ops_addr);

    let ops_app = axum::Router::new()
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler))
        .route(
            "/metrics",
            axum::routing::get(move || {
                let handle: PrometheusHandle = metrics_handle.clone();
                async move { handle.render() }
            }),
        )
        .layer(TraceLayer::new_for_http());

    let ops_listener = tokio::net::TcpListener::bind(ops_addr).await?;
    let ops_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(ops_listener, ops_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("AgriGate Outbox Relay started");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = relay_handle.await;
        let _ = ops_handle.await;
    })
    .await;

    info!("AgriGate Outbox Relay shutdown complete");
    Ok(())
}

async fn create_outbox_store(db_type: &str) -> Result<Arc<dyn OutboxStore>> {
    match db_type {
        "sqlite" => {
            let url = env_required("AG_DATABASE_URL")?;
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await?;
            let store = ag_store::sqlite::SqliteCaseStore::new(pool);
            store.init_schema().await?;
            info!("Using SQLite outbox store: {}", url);
            Ok(Arc::new(store))
        }
        "postgres" => {
            let url = env_required("AG_DATABASE_URL")?;
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await?;
            let store = ag_store::postgres::PostgresCaseStore::new(pool);
            store.init_schema().await?;
            info!("Using PostgreSQL outbox store");
            Ok(Arc::new(store))
        }
        other => Err(anyhow::anyhow!(
            "Unknown database type: {}. Use sqlite or postgres",
            other
        )),
    }
}

// SQS publisher for lifecycle notifications
struct SqsLifecyclePublisher {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    fifo: bool,
}

impl SqsLifecyclePublisher {
    fn new(client: aws_sdk_sqs::Client, queue_url: String) -> Self {
        let fifo = queue_url.ends_with(".fifo");
        Self {
            client,
            queue_url,
            fifo,
        }
    }
}

#[async_trait]
impl LifecyclePublisher for SqsLifecyclePublisher {
    async fn publish(&self, record: &OutboxRecord) -> Result<String> {
        let body = serde_json::to_string(&record.payload)?;
        let event_type = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(&record.event_type)
            .build()?;

        let mut request = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .message_attributes("eventType", event_type);

        if self.fifo {
            request = request
                .message_group_id(record.message_group.as_deref().unwrap_or("default"))
                .message_deduplication_id(record.id.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("SQS send error: {}", e))?;

        Ok(response.message_id().unwrap_or_default().to_string())
    }
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "READY"
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
