//! Manager-side SDK surface: the endpoints connectors talk to while a sync
//! runs. Events land in the durable queue; every call refreshes the run's
//! heartbeat so the stale-sync reaper leaves it alone.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use common::storage::types::{
    connector_event::{ConnectorEvent, EventPayload},
    content_blob::ContentBlob,
    service_credentials::ServiceCredentials,
    source::Source,
    sync_run::SyncRun,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct AppendEventParams {
    pub sync_run_id: String,
    pub source_id: String,
    pub event: EventPayload,
}

pub async fn append_event(
    State(state): State<ApiState>,
    Json(params): Json<AppendEventParams>,
) -> Result<impl IntoResponse, ApiError> {
    let event = ConnectorEvent::from_payload(
        params.sync_run_id.clone(),
        params.source_id,
        params.event,
    );
    event.append(&state.db).await?;
    SyncRun::increment_emitted(&state.db, &params.sync_run_id).await?;
    Ok((StatusCode::OK, Json(json!({"status": "ok"}))))
}

#[derive(Debug, Deserialize)]
pub struct StoreContentParams {
    pub sync_run_id: String,
    pub content: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

pub async fn store_content(
    State(state): State<ApiState>,
    Json(params): Json<StoreContentParams>,
) -> Result<impl IntoResponse, ApiError> {
    let content_id = ContentBlob::save(
        &state.db,
        &state.storage,
        Bytes::from(params.content.into_bytes()),
        &params.content_type,
    )
    .await?;
    SyncRun::heartbeat(&state.db, &params.sync_run_id).await?;
    Ok((StatusCode::OK, Json(json!({"content_id": content_id}))))
}

pub async fn heartbeat(
    State(state): State<ApiState>,
    Path(sync_run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    SyncRun::heartbeat(&state.db, &sync_run_id).await?;
    Ok((StatusCode::OK, Json(json!({"status": "ok"}))))
}

pub async fn increment_scanned(
    State(state): State<ApiState>,
    Path(sync_run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    SyncRun::increment_scanned(&state.db, &sync_run_id).await?;
    Ok((StatusCode::OK, Json(json!({"status": "ok"}))))
}

#[derive(Debug, Deserialize)]
pub struct SaveStateParams {
    pub state: Value,
}

/// Mid-sync checkpoint: persist connector state on the source so a cancelled
/// or crashed run resumes from it.
pub async fn save_state(
    State(state): State<ApiState>,
    Path(sync_run_id): Path<String>,
    Json(params): Json<SaveStateParams>,
) -> Result<impl IntoResponse, ApiError> {
    let run: SyncRun = state
        .db
        .get_item(&sync_run_id)
        .await
        .map_err(common::error::AppError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("sync run {sync_run_id}")))?;
    Source::save_connector_state(&state.db, &run.source_id, params.state).await?;
    SyncRun::heartbeat(&state.db, &sync_run_id).await?;
    Ok((StatusCode::OK, Json(json!({"status": "ok"}))))
}

#[derive(Debug, Deserialize)]
pub struct CompleteParams {
    pub documents_scanned: u64,
    pub documents_updated: u64,
    #[serde(default)]
    pub new_state: Option<Value>,
}

pub async fn complete(
    State(state): State<ApiState>,
    Path(sync_run_id): Path<String>,
    Json(params): Json<CompleteParams>,
) -> Result<impl IntoResponse, ApiError> {
    let run: SyncRun = state
        .db
        .get_item(&sync_run_id)
        .await
        .map_err(common::error::AppError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("sync run {sync_run_id}")))?;

    if let Some(new_state) = params.new_state {
        Source::save_connector_state(&state.db, &run.source_id, new_state).await?;
    }
    SyncRun::complete(
        &state.db,
        &sync_run_id,
        params.documents_scanned,
        params.documents_updated,
    )
    .await?;
    info!(
        %sync_run_id,
        scanned = params.documents_scanned,
        emitted = params.documents_updated,
        "sync run completed"
    );
    Ok((StatusCode::OK, Json(json!({"status": "ok"}))))
}

#[derive(Debug, Deserialize)]
pub struct FailParams {
    pub error: String,
}

pub async fn fail(
    State(state): State<ApiState>,
    Path(sync_run_id): Path<String>,
    Json(params): Json<FailParams>,
) -> Result<impl IntoResponse, ApiError> {
    SyncRun::fail(&state.db, &sync_run_id, &params.error).await?;
    info!(%sync_run_id, error = %params.error, "sync run failed");
    Ok((StatusCode::OK, Json(json!({"status": "ok"}))))
}

/// Everything a sync run needs: source config, credentials and prior state.
pub async fn sync_config(
    State(state): State<ApiState>,
    Path(source_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let source = Source::get_active(&state.db, &source_id).await?;
    let credentials = ServiceCredentials::get_for_source(&state.db, &source_id)
        .await?
        .map(|creds| creds.secret)
        .unwrap_or_else(|| json!({}));

    Ok((
        StatusCode::OK,
        Json(json!({
            "config": source.config,
            "credentials": credentials,
            "connector_state": source.connector_state,
        })),
    ))
}
