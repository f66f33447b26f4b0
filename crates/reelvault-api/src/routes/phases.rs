//! Phase submission routes

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::ApiResult;
use crate::state::AppState;
use reelvault_core::{BulkMode, Phase, SceneId, Subject};

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub mode: String,
}

/// POST /scenes/:id/phases/:phase
///
/// Submits one phase for one scene. Returns 202 with the job id; a
/// duplicate submission returns the already-active job's id.
async fn run_phase(
    State(state): State<AppState>,
    Extension(subject): Extension<Subject>,
    Path((scene_id, phase)): Path<(SceneId, String)>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let phase = Phase::parse(&phase)?;
    let submission = state.engine.run_phase(scene_id, phase).await?;

    info!(
        "Phase submitted: scene={}, phase={}, subject={}",
        scene_id, phase, subject.name
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": submission.job_id() })),
    ))
}

/// POST /phases/:phase/bulk
async fn bulk_run_phase(
    State(state): State<AppState>,
    Extension(subject): Extension<Subject>,
    Path(phase): Path<String>,
    Json(request): Json<BulkRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let phase = Phase::parse(&phase)?;
    let mode = BulkMode::parse(&request.mode)?;

    let outcome = state.engine.bulk_run_phase(phase, mode).await?;
    info!(
        "Bulk run requested: phase={}, subject={}",
        phase, subject.name
    );
    Ok(Json(json!(outcome)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/scenes/:id/phases/:phase", post(run_phase))
        .route("/phases/:phase/bulk", post(bulk_run_phase))
}
