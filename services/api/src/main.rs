//! API Service - HTTP trigger for the sales ETL
//!
//! Endpoints:
//! - GET /       - Run the pipeline once (200 / 404 / 500, plain text)
//! - GET /health - Liveness plus the last run's status

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use etl::bootstrap::build_pipeline;
use etl::logging::init_logging;
use etl::{Pipeline, RunLedger, RunOptions, RunOutcome, Settings};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct LastRun {
    status: &'static str,
    finished_at: DateTime<Utc>,
    rows_written: Option<usize>,
}

struct AppState {
    pipeline: Pipeline,
    ledger: RunLedger,
    /// Held for the whole run: invocations never overlap.
    run_lock: Mutex<()>,
    last_run: RwLock<Option<LastRun>>,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
    running: bool,
    last_run: Option<LastRun>,
}

const SUCCESS_BODY: &str = "Procesado exitosamente";
const NOT_FOUND_BODY: &str = "Archivo no encontrado";

/// Transport mapping of a run outcome.
fn outcome_response(outcome: &RunOutcome) -> (StatusCode, String) {
    match outcome {
        RunOutcome::Success(_) => (StatusCode::OK, SUCCESS_BODY.to_string()),
        RunOutcome::NotFound { .. } => (StatusCode::NOT_FOUND, NOT_FOUND_BODY.to_string()),
        RunOutcome::SchemaInvalid(_) | RunOutcome::Failed { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(
                "Error: {}",
                outcome.error_detail().unwrap_or_default()
            ),
        ),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let running = state.run_lock.try_lock().is_err();
    let last_run = state.last_run.read().await.clone();
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
        running,
        last_run,
    })
}

async fn trigger_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let _running = state.run_lock.lock().await;

    let source = &state.pipeline.targets().source_name;
    let job_run_id = state.ledger.start(source).await;
    let outcome = state.pipeline.run(RunOptions::default()).await;
    state.ledger.finish(job_run_id, &outcome).await;

    let rows_written = match &outcome {
        RunOutcome::Success(summary) => Some(summary.rows_written),
        _ => None,
    };
    *state.last_run.write().await = Some(LastRun {
        status: outcome.status(),
        finished_at: Utc::now(),
        rows_written,
    });

    let (status, body) = outcome_response(&outcome);
    if status.is_server_error() {
        warn!(status = status.as_u16(), body = %body, "trigger failed");
    }
    (status, body)
}

fn build_router(state: Arc<AppState>) -> Router {
    // CORS for browser-initiated triggers
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(trigger_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let settings = Settings::from_env().context("Invalid settings")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    let pipeline = build_pipeline(&settings, false)
        .await
        .context("Failed to configure pipeline")?;
    let ledger = RunLedger::connect(settings.db_url.as_deref()).await;

    let state = Arc::new(AppState {
        pipeline,
        ledger,
        run_lock: Mutex::new(()),
        last_run: RwLock::new(None),
    });
    let app = build_router(state);

    info!(%bind, "api listening");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
