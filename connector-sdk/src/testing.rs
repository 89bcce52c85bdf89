//! In-process mock of the connector-manager SDK surface, for connector and
//! runtime tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::models::SyncConfig;

#[derive(Clone, Default)]
pub struct MockManagerState {
    sources: Arc<Mutex<HashMap<String, SyncConfig>>>,
    events: Arc<Mutex<Vec<Value>>>,
    contents: Arc<Mutex<HashMap<String, (String, String)>>>,
    heartbeats: Arc<AtomicU64>,
    scanned: Arc<AtomicU64>,
    saved_states: Arc<Mutex<Vec<Value>>>,
    completions: Arc<Mutex<Vec<Value>>>,
    failures: Arc<Mutex<Vec<String>>>,
    content_seq: Arc<AtomicU64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MockManagerState {
    pub fn add_source(&self, source_id: &str, config: Value, credentials: Value, state: Option<Value>) {
        lock(&self.sources).insert(
            source_id.to_string(),
            SyncConfig {
                config,
                credentials,
                connector_state: state,
            },
        );
    }

    pub fn events(&self) -> Vec<Value> {
        lock(&self.events).clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e["event"]["type"].as_str().map(str::to_string))
            .collect()
    }

    pub fn content(&self, content_id: &str) -> Option<(String, String)> {
        lock(&self.contents).get(content_id).cloned()
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }

    pub fn scanned_count(&self) -> u64 {
        self.scanned.load(Ordering::Relaxed)
    }

    pub fn saved_states(&self) -> Vec<Value> {
        lock(&self.saved_states).clone()
    }

    pub fn completions(&self) -> Vec<Value> {
        lock(&self.completions).clone()
    }

    pub fn failures(&self) -> Vec<String> {
        lock(&self.failures).clone()
    }
}

/// A live mock manager on an ephemeral port.
pub struct MockManager {
    pub addr: SocketAddr,
    pub state: MockManagerState,
}

impl MockManager {
    pub async fn spawn() -> Self {
        let state = MockManagerState::default();
        let app = Router::new()
            .route("/sdk/source/{source_id}/sync-config", get(sync_config))
            .route("/sdk/events", post(append_event))
            .route("/sdk/content", post(store_content))
            .route("/sdk/sync/{sync_run_id}/heartbeat", post(heartbeat))
            .route("/sdk/sync/{sync_run_id}/scanned", post(scanned))
            .route("/sdk/sync/{sync_run_id}/state", post(save_state))
            .route("/sdk/sync/{sync_run_id}/complete", post(complete))
            .route("/sdk/sync/{sync_run_id}/fail", post(fail))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock manager");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

async fn sync_config(
    State(state): State<MockManagerState>,
    Path(source_id): Path<String>,
) -> Result<Json<SyncConfig>, StatusCode> {
    lock(&state.sources)
        .get(&source_id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn append_event(
    State(state): State<MockManagerState>,
    Json(body): Json<Value>,
) -> Json<Value> {
    lock(&state.events).push(body);
    state.heartbeats.fetch_add(1, Ordering::Relaxed);
    Json(json!({"status": "ok"}))
}

async fn store_content(
    State(state): State<MockManagerState>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let seq = state.content_seq.fetch_add(1, Ordering::Relaxed);
    let content_id = format!("content-{seq}");
    lock(&state.contents).insert(
        content_id.clone(),
        (
            body["content"].as_str().unwrap_or_default().to_string(),
            body["content_type"].as_str().unwrap_or("text/plain").to_string(),
        ),
    );
    Json(json!({"content_id": content_id}))
}

async fn heartbeat(State(state): State<MockManagerState>) -> Json<Value> {
    state.heartbeats.fetch_add(1, Ordering::Relaxed);
    Json(json!({"status": "ok"}))
}

async fn scanned(State(state): State<MockManagerState>) -> Json<Value> {
    state.scanned.fetch_add(1, Ordering::Relaxed);
    state.heartbeats.fetch_add(1, Ordering::Relaxed);
    Json(json!({"status": "ok"}))
}

async fn save_state(
    State(state): State<MockManagerState>,
    Json(body): Json<Value>,
) -> Json<Value> {
    lock(&state.saved_states).push(body["state"].clone());
    Json(json!({"status": "ok"}))
}

async fn complete(State(state): State<MockManagerState>, Json(body): Json<Value>) -> Json<Value> {
    lock(&state.completions).push(body);
    Json(json!({"status": "ok"}))
}

async fn fail(State(state): State<MockManagerState>, Json(body): Json<Value>) -> Json<Value> {
    lock(&state.failures).push(body["error"].as_str().unwrap_or_default().to_string());
    Json(json!({"status": "ok"}))
}
