//! Job history, cancellation, and DLQ routes

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::ApiResult;
use crate::state::AppState;
use reelvault_core::{Disposition, Error, JobId, Subject};

#[derive(Debug, Deserialize)]
struct PageParams {
    #[serde(default)]
    page: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
struct DlqParams {
    status: Option<String>,
    #[serde(default)]
    page: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn parse_job_id(raw: &str) -> Result<JobId, Error> {
    JobId::parse_str(raw).map_err(|_| Error::validation(format!("invalid job id: {}", raw)))
}

/// GET /jobs?page=&limit=
///
/// Paginated history plus the live picture: active jobs, queue depths,
/// pool config.
async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let (jobs, total) = state.store.page_history(params.page, params.limit).await?;
    let status = state.status_payload().await?;

    Ok(Json(json!({
        "jobs": jobs,
        "total": total,
        "page": params.page,
        "limit": params.limit,
        "status": status,
    })))
}

/// POST /jobs/:id/cancel
async fn cancel_job(
    State(state): State<AppState>,
    Extension(subject): Extension<Subject>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job_id = parse_job_id(&job_id)?;
    state.engine.cancel_job(job_id).await?;
    info!("Job cancelled: id={}, subject={}", job_id, subject.name);
    Ok(Json(json!({ "job_id": job_id, "status": "cancelled" })))
}

/// GET /jobs/dlq?status=&page=
async fn list_dlq(
    State(state): State<AppState>,
    Query(params): Query<DlqParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let disposition = params
        .status
        .as_deref()
        .map(Disposition::parse)
        .transpose()?;

    let (entries, total) = state
        .dlq
        .list(disposition, params.page, params.limit)
        .await?;
    let stats = state.dlq.stats().await?;

    Ok(Json(json!({
        "entries": entries,
        "total": total,
        "page": params.page,
        "limit": params.limit,
        "stats": stats,
    })))
}

/// POST /jobs/dlq/:id/retry
async fn retry_dlq(
    State(state): State<AppState>,
    Extension(subject): Extension<Subject>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job_id = parse_job_id(&job_id)?;
    let new_job_id = state.engine.resubmit_dlq(job_id).await?;
    info!(
        "DLQ resubmit: old={}, new={}, subject={}",
        job_id, new_job_id, subject.name
    );
    Ok(Json(json!({ "job_id": new_job_id })))
}

/// POST /jobs/dlq/:id/abandon
async fn abandon_dlq(
    State(state): State<AppState>,
    Extension(subject): Extension<Subject>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job_id = parse_job_id(&job_id)?;
    state.engine.abandon_dlq(job_id).await?;
    info!("DLQ abandon: id={}, subject={}", job_id, subject.name);
    Ok(Json(json!({ "job_id": job_id, "status": "abandoned" })))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/dlq", get(list_dlq))
        .route("/jobs/dlq/:id/retry", post(retry_dlq))
        .route("/jobs/dlq/:id/abandon", post(abandon_dlq))
        .route("/jobs/:id/cancel", post(cancel_job))
}
