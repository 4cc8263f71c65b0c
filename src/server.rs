//! HTTP control surface.
//!
//! Exposes run control and observability over the sync pipeline:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Store connectivity, last-run summary, current progress |
//! | `POST` | `/sync` | Start a run in the background; 409 while one is active |
//! | `GET`  | `/sync/status` | Last-run stats, live progress, persisted checkpoint |
//!
//! Error responses follow one schema:
//!
//! ```json
//! { "error": { "code": "sync_running", "message": "a sync run is already active" } }
//! ```
//!
//! A fatal run failure is reported as a degraded state with the last error
//! reason; it never takes the process down.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::models::{SyncState, SyncStats};
use crate::source::default_source;
use crate::store::RuleStore;
use crate::sync::{SyncError, SyncOrchestrator};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    store: RuleStore,
    orchestrator: Arc<SyncOrchestrator>,
}

/// Starts the HTTP control surface.
///
/// Binds to `[server].bind` and serves until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store = RuleStore::connect(&config.db.path).await?;
    store.ensure_schema().await?;

    let source = default_source(config)?;
    let orchestrator = Arc::new(SyncOrchestrator::new(
        store.clone(),
        source,
        config.sync.clone(),
    ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let state = AppState {
        store,
        orchestrator,
    };

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/sync", post(handle_sync))
        .route("/sync/status", get(handle_sync_status))
        .layer(cors)
        .with_state(state);

    info!(bind = %config.server.bind, "control surface listening");

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// 409 for a run that is already active.
fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "sync_running".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    store: String,
    running: bool,
    last_run: Option<SyncStats>,
    current_run: Option<SyncStats>,
}

/// Overall service health. Degraded when the store is unreachable or the
/// last run failed.
async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_ok = state.store.ping().await.is_ok();
    let last_run = state.orchestrator.last();
    let last_failed = last_run
        .as_ref()
        .map(|run| run.error.is_some())
        .unwrap_or(false);

    let status = if store_ok && !last_failed {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: if store_ok { "connected" } else { "unreachable" }.to_string(),
        running: state.orchestrator.is_running(),
        last_run,
        current_run: state.orchestrator.current(),
    })
}

// ============ POST /sync ============

#[derive(Deserialize, Default)]
struct SyncRequest {
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
struct SyncStarted {
    status: String,
    force: bool,
}

/// Starts a run if none is active. The handler only enqueues the run and
/// reports "started"; progress is observed via `/sync/status`.
///
/// The body is optional; an empty or malformed body means `force = false`.
async fn handle_sync(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<SyncStarted>), AppError> {
    let force = if body.is_empty() {
        false
    } else {
        serde_json::from_slice::<SyncRequest>(&body)
            .map(|req| req.force)
            .unwrap_or(false)
    };

    match state.orchestrator.start_background(force) {
        Ok(()) => Ok((
            StatusCode::ACCEPTED,
            Json(SyncStarted {
                status: "started".to_string(),
                force,
            }),
        )),
        Err(SyncError::AlreadyRunning) => Err(conflict("a sync run is already active")),
        Err(e) => Err(internal(e.to_string())),
    }
}

// ============ GET /sync/status ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncStatusResponse {
    running: bool,
    current: Option<SyncStats>,
    last: Option<SyncStats>,
    checkpoint: Option<SyncState>,
}

async fn handle_sync_status(State(state): State<AppState>) -> Json<SyncStatusResponse> {
    // A checkpoint read failure is reported as "no checkpoint", matching the
    // orchestrator's own tolerance.
    let checkpoint = state
        .store
        .get_checkpoint(state.orchestrator.source_label())
        .await
        .ok()
        .flatten();

    Json(SyncStatusResponse {
        running: state.orchestrator.is_running(),
        current: state.orchestrator.current(),
        last: state.orchestrator.last(),
        checkpoint,
    })
}
