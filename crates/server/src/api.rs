//! Run submission, polling and cancellation, plus health and workers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use exgraf_compute::transport::WorkerSnapshot;
use exgraf_compute::{RunError, RunStatus, RunSummary};
use exgraf_core::Tensor;
use exgraf_graph::GraphSpec;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn not_found(id: Uuid) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "not_found".into(),
            message: format!("no run {id}"),
        }),
    )
}

impl From<RunError> for ErrorBody {
    fn from(e: RunError) -> Self {
        Self {
            error: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

// ── Health ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub live_workers: usize,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let live_workers = state
        .workers
        .as_ref()
        .map_or(0, |w| w.snapshot().iter().filter(|s| s.live).count());
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        live_workers,
    })
}

pub async fn workers(State(state): State<Arc<AppState>>) -> Json<Vec<WorkerSnapshot>> {
    Json(state.workers.as_ref().map(|w| w.snapshot()).unwrap_or_default())
}

// ── Runs ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub graph: GraphSpec,
    #[serde(default)]
    pub feeds: HashMap<String, Tensor>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub id: Uuid,
}

pub async fn submit_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    match state.runs.submit_graph(req.graph, req.feeds) {
        Ok(id) => Ok((StatusCode::ACCEPTED, Json(SubmitResponse { id }))),
        Err(e) => {
            warn!(error = %e, "run rejected");
            Err((StatusCode::BAD_REQUEST, Json(e.into())))
        }
    }
}

pub async fn list_runs(State(state): State<Arc<AppState>>) -> Json<Vec<RunSummary>> {
    Json(state.runs.list())
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunStatus>, ApiError> {
    state.runs.poll(id).map(Json).ok_or_else(|| not_found(id))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub id: Uuid,
    pub cancelled: bool,
}

/// Cancelling a finished run is not an error; `cancelled` is just false.
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResponse>, ApiError> {
    if state.runs.poll(id).is_none() {
        return Err(not_found(id));
    }
    let cancelled = state.runs.cancel(id);
    Ok(Json(CancelResponse { id, cancelled }))
}
