#![allow(clippy::missing_docs_in_private_items)]

use axum::{
    extract::FromRef,
    routing::{get, post},
    Router,
};

use api_state::ApiState;
use routes::{
    embeddings::create_embeddings,
    liveness::live,
    readiness::ready,
    sdk::{
        append_event, complete, fail, heartbeat, increment_scanned, save_state, store_content,
        sync_config,
    },
};

pub mod api_state;
pub mod error;
mod routes;

/// Probe endpoints, version 1 (for k8s/systemd probes).
pub fn api_routes_v1<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live))
}

/// Interactive embedding surface for the chat/LLM subsystem.
pub fn embedding_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    Router::new().route("/embeddings", post(create_embeddings))
}

/// The SDK surface connectors call while syncing.
pub fn sdk_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    Router::new()
        .route("/sdk/events", post(append_event))
        .route("/sdk/content", post(store_content))
        .route("/sdk/sync/{sync_run_id}/heartbeat", post(heartbeat))
        .route("/sdk/sync/{sync_run_id}/scanned", post(increment_scanned))
        .route("/sdk/sync/{sync_run_id}/state", post(save_state))
        .route("/sdk/sync/{sync_run_id}/complete", post(complete))
        .route("/sdk/sync/{sync_run_id}/fail", post(fail))
        .route("/sdk/source/{source_id}/sync-config", get(sync_config))
}

/// The full service router.
pub fn app(state: ApiState) -> Router {
    Router::new()
        .nest("/api/v1", api_routes_v1())
        .merge(embedding_routes())
        .merge(sdk_routes())
        .with_state(state)
}
