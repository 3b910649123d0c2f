//! HTTP status and control surface.
//!
//! Routes:
//!   GET    /api/health               → latest health report
//!   GET    /api/storage              → storage usage
//!   GET    /api/segments             → indexed segments, newest first
//!   DELETE /api/segments             → delete every segment
//!   DELETE /api/segments/{id}        → delete one segment
//!   POST   /api/segments/{id}/save   → export a segment to the saved dir
//!   POST   /api/rotate               → close the current segment now
//!   POST   /api/call-state           → telephony bridge input

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use rewind_common::error::CaptureError;
use rewind_common::protocol::{CallStateRequest, HealthReport, RotateResponse, StorageResponse};
use rewind_common::segment::Segment;

use crate::arbiter::CallEvent;
use crate::controller::ControllerHandle;
use crate::retention::RetentionEngine;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: ControllerHandle,
    pub retention: Arc<RetentionEngine>,
    pub health: watch::Receiver<Option<HealthReport>>,
    pub call_events: Option<mpsc::Sender<CallEvent>>,
    pub saved_dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct SavedResponse {
    path: String,
}

#[derive(Debug, Serialize)]
struct DeletedResponse {
    deleted: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/storage", get(storage))
        .route("/api/segments", get(list_segments).delete(delete_all))
        .route("/api/segments/{id}", delete(delete_segment))
        .route("/api/segments/{id}/save", post(save_segment))
        .route("/api/rotate", post(rotate))
        .route("/api/call-state", post(call_state))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn run(state: AppState, listen_addr: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Status HTTP server listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

fn status_for(e: &CaptureError) -> StatusCode {
    match e {
        CaptureError::IndexUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Run a synchronous retention call off the async workers.
async fn with_engine<T, F>(state: &AppState, f: F) -> Result<T, StatusCode>
where
    T: Send + 'static,
    F: FnOnce(&RetentionEngine) -> Result<T, CaptureError> + Send + 'static,
{
    let engine = state.retention.clone();
    match tokio::task::spawn_blocking(move || f(&engine)).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => {
            warn!("Request failed: {e}");
            Err(status_for(&e))
        }
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Option<HealthReport>>) {
    let report = state.health.borrow().clone();
    let status = match &report {
        Some(r) if !r.is_healthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report))
}

async fn storage(State(state): State<AppState>) -> Result<Json<StorageResponse>, StatusCode> {
    let stats = with_engine(&state, |e| e.storage_stats()).await?;
    Ok(Json(stats.into()))
}

async fn list_segments(State(state): State<AppState>) -> Result<Json<Vec<Segment>>, StatusCode> {
    with_engine(&state, |e| e.store().get_all()).await.map(Json)
}

async fn delete_all(State(state): State<AppState>) -> Result<Json<DeletedResponse>, StatusCode> {
    let deleted = with_engine(&state, |e| e.delete_all()).await?;
    Ok(Json(DeletedResponse { deleted }))
}

async fn delete_segment(State(state): State<AppState>, Path(id): Path<i64>) -> StatusCode {
    match with_engine(&state, move |e| e.delete_segment(id)).await {
        Ok(true) => StatusCode::NO_CONTENT,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(status) => status,
    }
}

async fn save_segment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<SavedResponse>, StatusCode> {
    let saved_dir = state.saved_dir.clone();
    match with_engine(&state, move |e| e.save_segment(id, &saved_dir)).await? {
        Some(path) => Ok(Json(SavedResponse {
            path: path.display().to_string(),
        })),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn rotate(State(state): State<AppState>) -> Json<RotateResponse> {
    let done = state.controller.rotate().await;
    Json(RotateResponse {
        rotated: done.is_some(),
        completed: done.and_then(|d| {
            d.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        }),
    })
}

async fn call_state(State(state): State<AppState>, Json(req): Json<CallStateRequest>) -> StatusCode {
    let Some(tx) = &state.call_events else {
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    match tx.send(CallEvent::from(req)).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
