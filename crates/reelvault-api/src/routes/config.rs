//! Runtime config routes: pool sizes, trigger table, retry tunables

use axum::extract::State;
use axum::routing::get;
use axum::{Extension, Json, Router};
use tracing::info;

use crate::error::ApiResult;
use crate::state::AppState;
use reelvault_core::{PoolConfig, RetryConfig, Subject, TriggerConfig};

async fn get_pool(State(state): State<AppState>) -> Json<PoolConfig> {
    Json((*state.configs.pool()).clone())
}

/// PUT /config/pool. Out-of-range worker counts are a 400.
async fn put_pool(
    State(state): State<AppState>,
    Extension(subject): Extension<Subject>,
    Json(config): Json<PoolConfig>,
) -> ApiResult<Json<PoolConfig>> {
    state.configs.update_pool(config.clone()).await?;
    info!("Pool config changed: subject={}", subject.name);
    Ok(Json(config))
}

async fn get_trigger(State(state): State<AppState>) -> Json<TriggerConfig> {
    Json((*state.configs.trigger()).clone())
}

/// PUT /config/trigger. A cycle in the after_job graph is a 400 with
/// code CYCLE_DETECTED and leaves the effective table untouched.
async fn put_trigger(
    State(state): State<AppState>,
    Extension(subject): Extension<Subject>,
    Json(config): Json<TriggerConfig>,
) -> ApiResult<Json<TriggerConfig>> {
    state.configs.update_trigger(config.clone()).await?;
    info!("Trigger config changed: subject={}", subject.name);
    Ok(Json(config))
}

async fn get_retry(State(state): State<AppState>) -> Json<RetryConfig> {
    Json((*state.configs.retry()).clone())
}

async fn put_retry(
    State(state): State<AppState>,
    Extension(subject): Extension<Subject>,
    Json(config): Json<RetryConfig>,
) -> ApiResult<Json<RetryConfig>> {
    state.configs.update_retry(config.clone()).await?;
    info!("Retry config changed: subject={}", subject.name);
    Ok(Json(config))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/config/pool", get(get_pool).put(put_pool))
        .route("/config/trigger", get(get_trigger).put(put_trigger))
        .route("/config/retry", get(get_retry).put(put_retry))
}
