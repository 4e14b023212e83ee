//! AgriGate Intake Worker
//!
//! Consumes "application submitted" events from the intake queue and opens
//! an insurance case for each: batch assignment, case row, empty detail
//! records and a staged lifecycle notification, committed in one
//! transaction. Supports SQLite and PostgreSQL case stores.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `AG_DB_TYPE` | `postgres` | Database type: `sqlite`, `postgres` |
//! | `AG_DATABASE_URL` | - | Database connection URL (required) |
//! | `AG_INTAKE_QUEUE_URL` | - | SQS queue with submitted events (required) |
//! | `AG_DEAD_LETTER_QUEUE_URL` | - | SQS queue for unprocessable messages (required) |
//! | `AG_MAX_MESSAGES_PER_POLL` | `10` | Max messages per receive call |
//! | `AG_METRICS_PORT` | `9090` | Metrics/health port |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ag_common::EVENT_APPLICATION_SUBMITTED;
use ag_intake::sqs::{SqsDeadLetterSink, SqsEventConsumer};
use ag_intake::{DispatchTable, EventConsumer, IntakeRunner, IntakeService, RunnerConfig};
use ag_store::CaseStore;

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

    info!("Starting AgriGate Intake Worker");

    // 2. Configuration
    let db_type = env_or("AG_DB_TYPE", "postgres");
    let intake_queue_url = env_required("AG_INTAKE_QUEUE_URL")?;
    let dead_letter_queue_url = env_required("AG_DEAD_LETTER_QUEUE_URL")?;
    let max_messages_per_poll: u32 = env_or_parse("AG_MAX_MESSAGES_PER_POLL", 10);
    let metrics_port: u16 = env_or_parse("AG_METRICS_PORT", 9090);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // 3. Metrics recorder
    let metrics_handle = PrometheusBuilder::new().install_recorder()?;

    // 4. Case store
    let store = create_case_store(&db_type).await?;
    info!("Case store initialized ({})", db_type);

    // 5. SQS consumer and dead-letter sink
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let sqs_client = aws_sdk_sqs::Client::new(&aws_config);
    let consumer = Arc::new(SqsEventConsumer::new(
        sqs_client.clone(),
        intake_queue_url.clone(),
    ));
    let dead_letters = Arc::new(SqsDeadLetterSink::new(sqs_client, dead_letter_queue_url));
    info!("Intake queue: {}", intake_queue_url);

    // 6. Dispatch table, validated before any message is polled
    let mut dispatch = DispatchTable::new();
    dispatch.register(
        EVENT_APPLICATION_SUBMITTED,
        Arc::new(IntakeService::new(store)),
    );
    dispatch.validate(&[EVENT_APPLICATION_SUBMITTED])?;

    // 7. Intake runner
    let runner = Arc::new(IntakeRunner::new(
        consumer.clone(),
        Arc::new(dispatch),
        dead_letters,
        RunnerConfig {
            max_messages_per_poll,
            ..RunnerConfig::default()
        },
    ));
    let runner_handle = tokio::spawn(runner.start(shutdown_tx.subscribe()));

    // 8. Ops server
    let ops_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    info!("Ops server listening on http://{}/metrics", ops_addr);

    let ready_consumer = consumer.clone();
    let ops_app = axum::Router::new()
        .route("/health", axum::routing::get(health_handler))
        .route(
            "/ready",
            axum::routing::get(move || {
                let consumer = ready_consumer.clone();
                async move { ready_response(consumer.is_healthy()) }
            }),
        )
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

    info!("AgriGate Intake Worker started");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = runner_handle.await;
        let _ = ops_handle.await;
    })
    .await;

    info!("AgriGate Intake Worker shutdown complete");
    Ok(())
}

async fn create_case_store(db_type: &str) -> Result<Arc<dyn CaseStore>> {
    match db_type {
        "sqlite" => {
            let url = env_required("AG_DATABASE_URL")?;
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await?;
            let store = ag_store::sqlite::SqliteCaseStore::new(pool);
            store.init_schema().await?;
            info!("Using SQLite case store: {}", url);
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
            info!("Using PostgreSQL case store");
            Ok(Arc::new(store))
        }
        other => Err(anyhow::anyhow!(
            "Unknown database type: {}. Use sqlite or postgres",
            other
        )),
    }
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Not ready until the consumer's most recent queue poll has succeeded
fn ready_response(healthy: bool) -> (axum::http::StatusCode, axum::Json<serde_json::Value>) {
    if healthy {
        (
            axum::http::StatusCode::OK,
            axum::Json(serde_json::json!({ "status": "READY" })),
        )
    } else {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({ "status": "NOT_READY" })),
        )
    }
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
