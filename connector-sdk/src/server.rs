use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::error::AppError;
use moka::future::Cache;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::client::ManagerClient;
use crate::connector::Connector;
use crate::context::SyncContext;
use crate::models::{
    ActionMode, ActionRequest, ActionResponse, CancelRequest, CancelResponse, Manifest,
    SyncRequest, SyncResponse,
};

const ACTION_TIMEOUT: Duration = Duration::from_secs(30);
const ACTION_CACHE_TTL: Duration = Duration::from_secs(300);
const ACTION_CACHE_CAPACITY: u64 = 256;

struct ActiveSync {
    sync_run_id: String,
    ctx: Arc<SyncContext>,
}

/// Shared state of the connector runtime HTTP surface.
#[derive(Clone)]
pub struct ConnectorServerState {
    connector: Arc<dyn Connector>,
    client: Arc<ManagerClient>,
    active: Arc<Mutex<HashMap<String, ActiveSync>>>,
    /// Read-action results, TTL'd and single-flight per key.
    action_cache: Cache<String, Value>,
    max_concurrent_syncs: usize,
}

/// Build the runtime app hosting one connector:
/// `/health`, `/manifest`, `/sync`, `/cancel`, `/action`.
pub fn connector_app(
    connector: Arc<dyn Connector>,
    client: Arc<ManagerClient>,
    max_concurrent_syncs: usize,
) -> Router {
    let state = ConnectorServerState {
        connector,
        client,
        active: Arc::new(Mutex::new(HashMap::new())),
        action_cache: Cache::builder()
            .time_to_live(ACTION_CACHE_TTL)
            .max_capacity(ACTION_CACHE_CAPACITY)
            .build(),
        max_concurrent_syncs,
    };

    Router::new()
        .route("/health", get(health))
        .route("/manifest", get(manifest))
        .route("/sync", post(trigger_sync))
        .route("/cancel", post(cancel_sync))
        .route("/action", post(invoke_action))
        .with_state(state)
}

fn lock_active(
    active: &Mutex<HashMap<String, ActiveSync>>,
) -> MutexGuard<'_, HashMap<String, ActiveSync>> {
    match active.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn health(State(state): State<ConnectorServerState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": state.connector.name(),
    }))
}

async fn manifest(State(state): State<ConnectorServerState>) -> Json<Manifest> {
    Json(state.connector.manifest())
}

async fn trigger_sync(
    State(state): State<ConnectorServerState>,
    Json(request): Json<SyncRequest>,
) -> (StatusCode, Json<SyncResponse>) {
    info!(
        source_id = %request.source_id,
        sync_run_id = %request.sync_run_id,
        sync_mode = ?request.sync_mode,
        "sync triggered"
    );

    {
        let active = lock_active(&state.active);
        if active.contains_key(&request.source_id) {
            return (
                StatusCode::CONFLICT,
                Json(SyncResponse::error("Sync already in progress for this source")),
            );
        }
        if active.len() >= state.max_concurrent_syncs {
            return (
                StatusCode::CONFLICT,
                Json(SyncResponse::error("Concurrent sync limit reached")),
            );
        }
    }

    let sync_config = match state.client.fetch_sync_config(&request.source_id).await {
        Ok(config) => config,
        Err(AppError::NotFound(_)) => {
            return (
                StatusCode::NOT_FOUND,
                Json(SyncResponse::error(format!(
                    "Source not found: {}",
                    request.source_id
                ))),
            );
        }
        Err(err) => {
            error!(error = %err, "failed to fetch source data");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(SyncResponse::error(format!(
                    "Failed to fetch source data: {err}"
                ))),
            );
        }
    };

    let ctx = Arc::new(SyncContext::new(
        Arc::clone(&state.client),
        request.sync_run_id.clone(),
        request.source_id.clone(),
    ));

    {
        let mut active = lock_active(&state.active);
        // Re-check: a concurrent trigger may have won while we fetched config
        if active.contains_key(&request.source_id) {
            return (
                StatusCode::CONFLICT,
                Json(SyncResponse::error("Sync already in progress for this source")),
            );
        }
        active.insert(
            request.source_id.clone(),
            ActiveSync {
                sync_run_id: request.sync_run_id.clone(),
                ctx: Arc::clone(&ctx),
            },
        );
    }

    tokio::spawn(run_sync(state, request, sync_config, ctx));

    (StatusCode::OK, Json(SyncResponse::started()))
}

async fn run_sync(
    state: ConnectorServerState,
    request: SyncRequest,
    sync_config: crate::models::SyncConfig,
    ctx: Arc<SyncContext>,
) {
    let result = state
        .connector
        .sync(
            sync_config.config,
            sync_config.credentials,
            sync_config.connector_state,
            Arc::clone(&ctx),
        )
        .await;

    if let Err(err) = result {
        let message = match err {
            AppError::Cancelled => "Cancelled by user".to_string(),
            err => err.to_string(),
        };
        warn!(sync_run_id = %request.sync_run_id, error = %message, "sync ended with error");
        if let Err(fail_err) = ctx.fail(&message).await {
            error!(
                sync_run_id = %request.sync_run_id,
                error = %fail_err,
                "failed to report sync failure to manager"
            );
        }
    }

    lock_active(&state.active).remove(&request.source_id);
}

async fn cancel_sync(
    State(state): State<ConnectorServerState>,
    Json(request): Json<CancelRequest>,
) -> Json<CancelResponse> {
    let cancelled = {
        let active = lock_active(&state.active);
        active
            .values()
            .find(|sync| sync.sync_run_id == request.sync_run_id)
            .map(|sync| sync.ctx.cancel())
            .is_some()
    };

    if cancelled {
        info!(sync_run_id = %request.sync_run_id, "cancellation requested");
        Json(CancelResponse {
            status: "cancelled".into(),
        })
    } else {
        Json(CancelResponse {
            status: "not_found".into(),
        })
    }
}

async fn invoke_action(
    State(state): State<ConnectorServerState>,
    Json(request): Json<ActionRequest>,
) -> Json<ActionResponse> {
    let definition = state
        .connector
        .actions()
        .into_iter()
        .find(|action| action.name == request.action);
    let cacheable = definition
        .as_ref()
        .is_some_and(|action| action.mode == ActionMode::Read);

    let result = if cacheable {
        let key = format!(
            "{}:{}",
            request.action,
            serde_json::to_string(&request.params).unwrap_or_default()
        );
        let connector = Arc::clone(&state.connector);
        let action = request.action.clone();
        let params = request.params.clone();
        let credentials = request.credentials.clone();
        state
            .action_cache
            .try_get_with(key, async move {
                run_action(&*connector, &action, params, credentials).await
            })
            .await
            .map_err(|err: Arc<AppError>| AppError::InternalError(err.to_string()))
    } else {
        run_action(&*state.connector, &request.action, request.params, request.credentials).await
    };

    match result {
        Ok(value) => Json(ActionResponse::success(value)),
        Err(err) => {
            warn!(action = %request.action, error = %err, "action failed");
            Json(ActionResponse::error(err.to_string()))
        }
    }
}

async fn run_action(
    connector: &dyn Connector,
    action: &str,
    params: Value,
    credentials: Value,
) -> Result<Value, AppError> {
    match tokio::time::timeout(ACTION_TIMEOUT, connector.action(action, params, credentials)).await
    {
        Ok(result) => result,
        Err(_) => Err(AppError::InternalError(format!(
            "action {action} timed out after {}s",
            ACTION_TIMEOUT.as_secs()
        ))),
    }
}
