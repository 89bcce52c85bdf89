//! Delta-semantics tests against a stub Graph API: first walk is a full
//! snapshot, the second replays only changes, deletes arrive as tombstones.

use std::sync::{Arc, Mutex};

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use connector_sdk::testing::MockManager;
use connector_sdk::{Connector, ManagerClient, SyncContext};
use msgraph_connector::MsGraphConnector;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Stub Graph tenant: one user, a mail delta feed that serves a snapshot on
/// the first call and a tombstone once a delta token comes back.
#[derive(Clone, Default)]
struct StubGraphState {
    mail_delta_calls: Arc<Mutex<Vec<bool>>>,
}

async fn spawn_stub_graph(state: StubGraphState) -> String {
    let app = Router::new()
        .route("/organization", get(organization))
        .route("/users", get(users))
        .route(
            "/users/user-1/mailFolders/inbox/messages/delta",
            get(mail_delta),
        )
        .route("/users/user-1/events/delta", get(empty_delta))
        .route("/users/user-1/drive/root/delta", get(empty_delta))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub graph");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn organization() -> Json<Value> {
    Json(json!({"value": [{"id": "org-1", "displayName": "Contoso"}]}))
}

async fn users() -> Json<Value> {
    Json(json!({
        "value": [{
            "id": "user-1",
            "displayName": "Ada",
            "mail": "ada@contoso.com",
            "userPrincipalName": "ada@contoso.com",
        }]
    }))
}

async fn mail_delta(
    State(state): State<StubGraphState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let incremental = params.contains_key("deltatoken");
    match state.mail_delta_calls.lock() {
        Ok(mut calls) => calls.push(incremental),
        Err(_) => {}
    }

    if incremental {
        // Change feed: one message was deleted upstream
        Json(json!({
            "value": [{"id": "msg-1", "@removed": {"reason": "deleted"}}],
            "@odata.deltaLink": "SELF?deltatoken=v2",
        }))
    } else {
        Json(json!({
            "value": [
                {
                    "id": "msg-1",
                    "subject": "Welcome",
                    "body": {"content": "<p>Hello Ada</p>", "contentType": "html"},
                    "from": {"emailAddress": {"address": "hr@contoso.com"}},
                    "receivedDateTime": "2024-06-01T08:00:00Z",
                },
                {
                    "id": "msg-2",
                    "subject": "Numbers",
                    "body": {"content": "Plain body", "contentType": "text"},
                    "from": {"emailAddress": {"address": "cfo@contoso.com"}},
                    "receivedDateTime": "2024-06-01T09:00:00Z",
                },
            ],
            "@odata.deltaLink": "SELF?deltatoken=v1",
        }))
    }
}

async fn empty_delta(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    let token = if params.contains_key("deltatoken") {
        "SELF?deltatoken=same"
    } else {
        "SELF?deltatoken=initial"
    };
    Json(json!({"value": [], "@odata.deltaLink": token}))
}

fn ctx_for(manager: &MockManager, run_id: &str) -> Arc<SyncContext> {
    let client = Arc::new(ManagerClient::new(&manager.url()).expect("manager client"));
    Arc::new(SyncContext::new(client, run_id.into(), "src-ms".into()))
}

/// Delta links in stub responses are relative ("SELF?..."); rewrite them to
/// absolute URLs the client can follow.
fn fix_delta_links(state: &mut Value, base: &str, path: &str) {
    if let Some(token) = state.as_str() {
        if let Some(query) = token.strip_prefix("SELF") {
            *state = Value::String(format!("{base}{path}{query}"));
        }
    }
}

#[tokio::test]
async fn full_then_incremental_with_tombstone() {
    let manager = MockManager::spawn().await;
    let graph_state = StubGraphState::default();
    let graph_url = spawn_stub_graph(graph_state.clone()).await;

    let config = json!({"services": ["mail"], "graph_base_url": graph_url});
    let credentials = json!({"token": "static-token"});

    // First run: full snapshot
    let ctx = ctx_for(&manager, "run-1");
    MsGraphConnector
        .sync(config.clone(), credentials.clone(), None, ctx)
        .await
        .expect("first sync");

    let events = manager.state.events();
    assert_eq!(events.len(), 2, "snapshot emits both messages");
    assert!(manager
        .state
        .event_types()
        .iter()
        .all(|t| t == "document_created"));

    // HTML bodies are flattened before storage
    let welcome = events
        .iter()
        .find(|e| e["event"]["document_id"] == "mail:user-1:msg-1")
        .expect("welcome event");
    let content_id = welcome["event"]["content_id"].as_str().expect("content id");
    let (content, _) = manager.state.content(content_id).expect("content stored");
    assert!(content.contains("Hello Ada"));
    assert!(!content.contains("<p>"));

    let mut state = manager.state.completions()[0]["new_state"].clone();
    assert!(state["mail"]["user-1"]
        .as_str()
        .expect("delta token recorded")
        .contains("deltatoken=v1"));
    fix_delta_links(
        &mut state["mail"]["user-1"],
        &graph_url,
        "/users/user-1/mailFolders/inbox/messages/delta",
    );

    // Second run: only the tombstone comes back
    let ctx = ctx_for(&manager, "run-2");
    MsGraphConnector
        .sync(config, credentials, Some(state), ctx)
        .await
        .expect("second sync");

    let all_types = manager.state.event_types();
    assert_eq!(
        all_types.iter().filter(|t| *t == "document_deleted").count(),
        1,
        "the removed message becomes a tombstone"
    );
    let deleted = manager
        .state
        .events()
        .into_iter()
        .find(|e| e["event"]["type"] == "document_deleted")
        .expect("tombstone event");
    assert_eq!(deleted["event"]["document_id"], "mail:user-1:msg-1");

    // The stub saw one snapshot call and one incremental call
    let calls = match graph_state.mail_delta_calls.lock() {
        Ok(calls) => calls.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    assert_eq!(calls, vec![false, true]);
}

#[tokio::test]
async fn missing_credentials_fail_the_sync() {
    let manager = MockManager::spawn().await;
    let ctx = ctx_for(&manager, "run-1");

    MsGraphConnector
        .sync(json!({}), json!({}), None, ctx)
        .await
        .expect("sync returns after failing the run");

    let failures = manager.state.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("tenant_id"));
}
