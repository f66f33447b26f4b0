//! Shared handler state

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use reelvault_core::{
    Clock, ConfigCache, DeadLetterQueue, EventBus, JobStore, Phase, ScenePathCache,
    SqliteSceneRepo, StreamAdmission, TriggerEngine,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TriggerEngine>,
    pub store: JobStore,
    pub dlq: DeadLetterQueue,
    pub configs: Arc<ConfigCache>,
    pub events: EventBus,
    pub admission: Arc<StreamAdmission>,
    pub paths: Arc<ScenePathCache>,
    pub scenes: SqliteSceneRepo,
    pub clock: Arc<dyn Clock>,
    pub status_interval: Duration,
}

impl AppState {
    /// The `jobs:status` aggregate used by GET /jobs and the SSE stream
    pub async fn status_payload(&self) -> reelvault_core::Result<serde_json::Value> {
        let active = self.store.list_active().await?;
        let counts = self.store.counts_by_state().await?;
        let dlq_stats = self.dlq.stats().await?;
        let queues = self.engine.queue_statuses();
        let pool = self.configs.pool();

        let queues_json: serde_json::Map<String, serde_json::Value> = Phase::ALL
            .into_iter()
            .map(|phase| {
                let status = queues.get(&phase).copied().unwrap_or_default();
                (phase.as_str().to_string(), json!(status))
            })
            .collect();

        let counts_json: serde_json::Map<String, serde_json::Value> = counts
            .into_iter()
            .map(|(state, n)| (state.as_str().to_string(), json!(n)))
            .collect();

        Ok(json!({
            "active": active,
            "queues": queues_json,
            "states": counts_json,
            "pool": &*pool,
            "dlq": dlq_stats,
        }))
    }
}
