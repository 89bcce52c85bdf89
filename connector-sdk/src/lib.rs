#![allow(clippy::missing_docs_in_private_items)]

//! Connector SDK: the `Connector` trait, the sync context handed to running
//! connectors, the manager HTTP client and the runtime HTTP server that
//! hosts a connector behind `/sync`, `/cancel`, `/action`, `/manifest` and
//! `/health`.

pub mod client;
pub mod connector;
pub mod context;
pub mod models;
pub mod server;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use client::ManagerClient;
pub use connector::Connector;
pub use context::SyncContext;
pub use server::connector_app;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ActionDefinition, ActionMode, Document, Manifest, SyncMode, SyncRequest,
    };
    use crate::testing::MockManager;
    use async_trait::async_trait;
    use common::error::AppError;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Connector that emits a fixed number of documents, checkpointing state
    /// and honoring cancellation between entities.
    struct ScriptedConnector {
        documents: usize,
        delay: Duration,
        action_calls: AtomicU64,
    }

    impl ScriptedConnector {
        fn new(documents: usize, delay: Duration) -> Self {
            Self {
                documents,
                delay,
                action_calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        fn name(&self) -> &str {
            "scripted"
        }

        fn version(&self) -> &str {
            "1.0.0"
        }

        fn actions(&self) -> Vec<ActionDefinition> {
            vec![ActionDefinition {
                name: "lookup".into(),
                description: "Read-only lookup".into(),
                parameters: json!({"type": "object"}),
                mode: ActionMode::Read,
            }]
        }

        async fn sync(
            &self,
            _source_config: Value,
            credentials: Value,
            _state: Option<Value>,
            ctx: Arc<SyncContext>,
        ) -> Result<(), AppError> {
            if credentials["token"].as_str().unwrap_or_default().is_empty() {
                ctx.fail("Authentication failed: missing token").await?;
                return Ok(());
            }

            for i in 0..self.documents {
                if ctx.is_cancelled() {
                    ctx.save_state(&json!({"position": i})).await?;
                    return Err(AppError::Cancelled);
                }
                ctx.increment_scanned().await?;
                let content_id = ctx.save_content(&format!("body {i}"), "text/plain").await?;
                ctx.emit(Document {
                    external_id: format!("doc-{i}"),
                    title: format!("Document {i}"),
                    content_id,
                    metadata: None,
                    permissions: None,
                    attributes: None,
                })
                .await?;
                if self.delay > Duration::ZERO {
                    tokio::time::sleep(self.delay).await;
                }
            }
            ctx.complete(Some(&json!({"position": self.documents}))).await?;
            Ok(())
        }

        async fn action(
            &self,
            action: &str,
            params: Value,
            _credentials: Value,
        ) -> Result<Value, AppError> {
            if action != "lookup" {
                return Err(AppError::Validation(format!("unknown action: {action}")));
            }
            self.action_calls.fetch_add(1, Ordering::Relaxed);
            Ok(json!({"echo": params}))
        }
    }

    async fn spawn_runtime(
        connector: Arc<dyn Connector>,
        manager_url: &str,
    ) -> (String, Arc<ManagerClient>) {
        let client = Arc::new(ManagerClient::new(manager_url).expect("client"));
        let app = connector_app(connector, Arc::clone(&client), 10);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind runtime");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), client)
    }

    async fn wait_until<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
        let started = std::time::Instant::now();
        while started.elapsed() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn health_and_manifest_describe_the_connector() {
        let manager = MockManager::spawn().await;
        let connector = Arc::new(ScriptedConnector::new(0, Duration::ZERO));
        let (url, _) = spawn_runtime(connector, &manager.url()).await;
        let http = reqwest::Client::new();

        let health: Value = http
            .get(format!("{url}/health"))
            .send()
            .await
            .expect("health")
            .json()
            .await
            .expect("json");
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["service"], "scripted");

        let manifest: Manifest = http
            .get(format!("{url}/manifest"))
            .send()
            .await
            .expect("manifest")
            .json()
            .await
            .expect("json");
        assert_eq!(manifest.name, "scripted");
        assert_eq!(manifest.sync_modes, vec![SyncMode::Full, SyncMode::Incremental]);
        assert_eq!(manifest.actions.len(), 1);
    }

    #[tokio::test]
    async fn sync_runs_to_completion_and_emits_documents() {
        let manager = MockManager::spawn().await;
        manager
            .state
            .add_source("src-1", json!({}), json!({"token": "t"}), None);
        let connector = Arc::new(ScriptedConnector::new(3, Duration::ZERO));
        let (url, _) = spawn_runtime(connector, &manager.url()).await;
        let http = reqwest::Client::new();

        let response = http
            .post(format!("{url}/sync"))
            .json(&SyncRequest {
                sync_run_id: "run-1".into(),
                source_id: "src-1".into(),
                sync_mode: SyncMode::Full,
            })
            .send()
            .await
            .expect("sync");
        assert_eq!(response.status(), 200);

        let state = manager.state.clone();
        assert!(
            wait_until(Duration::from_secs(5), || !state.completions().is_empty()).await,
            "sync should complete"
        );

        assert_eq!(manager.state.events().len(), 3);
        assert!(manager
            .state
            .event_types()
            .iter()
            .all(|t| t == "document_created"));
        assert_eq!(manager.state.scanned_count(), 3);

        let completion = manager.state.completions().remove(0);
        assert_eq!(completion["documents_scanned"], 3);
        assert_eq!(completion["documents_updated"], 3);
        assert_eq!(completion["new_state"]["position"], 3);
    }

    #[tokio::test]
    async fn overlapping_sync_gets_conflict() {
        let manager = MockManager::spawn().await;
        manager
            .state
            .add_source("src-1", json!({}), json!({"token": "t"}), None);
        let connector = Arc::new(ScriptedConnector::new(100, Duration::from_millis(20)));
        let (url, _) = spawn_runtime(connector, &manager.url()).await;
        let http = reqwest::Client::new();

        let first = http
            .post(format!("{url}/sync"))
            .json(&SyncRequest {
                sync_run_id: "run-1".into(),
                source_id: "src-1".into(),
                sync_mode: SyncMode::Full,
            })
            .send()
            .await
            .expect("sync");
        assert_eq!(first.status(), 200);

        let second = http
            .post(format!("{url}/sync"))
            .json(&SyncRequest {
                sync_run_id: "run-2".into(),
                source_id: "src-1".into(),
                sync_mode: SyncMode::Incremental,
            })
            .send()
            .await
            .expect("sync");
        assert_eq!(second.status(), 409);
    }

    #[tokio::test]
    async fn unknown_source_is_404() {
        let manager = MockManager::spawn().await;
        let connector = Arc::new(ScriptedConnector::new(0, Duration::ZERO));
        let (url, _) = spawn_runtime(connector, &manager.url()).await;
        let http = reqwest::Client::new();

        let response = http
            .post(format!("{url}/sync"))
            .json(&SyncRequest {
                sync_run_id: "run-1".into(),
                source_id: "missing".into(),
                sync_mode: SyncMode::Full,
            })
            .send()
            .await
            .expect("sync");
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn cancel_interrupts_a_running_sync_and_persists_state() {
        let manager = MockManager::spawn().await;
        manager
            .state
            .add_source("src-1", json!({}), json!({"token": "t"}), None);
        let connector = Arc::new(ScriptedConnector::new(50, Duration::from_millis(30)));
        let (url, _) = spawn_runtime(connector, &manager.url()).await;
        let http = reqwest::Client::new();

        http.post(format!("{url}/sync"))
            .json(&SyncRequest {
                sync_run_id: "run-1".into(),
                source_id: "src-1".into(),
                sync_mode: SyncMode::Full,
            })
            .send()
            .await
            .expect("sync");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let cancel: Value = http
            .post(format!("{url}/cancel"))
            .json(&json!({"sync_run_id": "run-1"}))
            .send()
            .await
            .expect("cancel")
            .json()
            .await
            .expect("json");
        assert_eq!(cancel["status"], "cancelled");

        let state = manager.state.clone();
        assert!(
            wait_until(Duration::from_secs(5), || !state.failures().is_empty()).await,
            "cancelled sync should reach a terminal state"
        );
        assert!(manager.state.failures()[0].contains("Cancelled"));
        assert!(manager.state.events().len() < 50, "cancel must cut the run short");
        assert!(
            !manager.state.saved_states().is_empty(),
            "partial state must be checkpointed"
        );
    }

    #[tokio::test]
    async fn cancel_for_unknown_run_reports_not_found() {
        let manager = MockManager::spawn().await;
        let connector = Arc::new(ScriptedConnector::new(0, Duration::ZERO));
        let (url, _) = spawn_runtime(connector, &manager.url()).await;

        let cancel: Value = reqwest::Client::new()
            .post(format!("{url}/cancel"))
            .json(&json!({"sync_run_id": "nope"}))
            .send()
            .await
            .expect("cancel")
            .json()
            .await
            .expect("json");
        assert_eq!(cancel["status"], "not_found");
    }

    #[tokio::test]
    async fn bad_credentials_fail_the_sync() {
        let manager = MockManager::spawn().await;
        manager
            .state
            .add_source("src-1", json!({}), json!({"token": ""}), None);
        let connector = Arc::new(ScriptedConnector::new(3, Duration::ZERO));
        let (url, _) = spawn_runtime(connector, &manager.url()).await;

        reqwest::Client::new()
            .post(format!("{url}/sync"))
            .json(&SyncRequest {
                sync_run_id: "run-1".into(),
                source_id: "src-1".into(),
                sync_mode: SyncMode::Full,
            })
            .send()
            .await
            .expect("sync");

        let state = manager.state.clone();
        assert!(wait_until(Duration::from_secs(5), || !state.failures().is_empty()).await);
        let failure = manager.state.failures().remove(0);
        assert!(failure.to_lowercase().contains("token") || failure.to_lowercase().contains("auth"));
    }

    #[tokio::test]
    async fn read_actions_are_cached_single_flight() {
        let manager = MockManager::spawn().await;
        let connector = Arc::new(ScriptedConnector::new(0, Duration::ZERO));
        let calls = Arc::clone(&connector);
        let (url, _) = spawn_runtime(connector, &manager.url()).await;
        let http = reqwest::Client::new();

        for _ in 0..3 {
            let response: Value = http
                .post(format!("{url}/action"))
                .json(&json!({"action": "lookup", "params": {"q": "same"}, "credentials": {}}))
                .send()
                .await
                .expect("action")
                .json()
                .await
                .expect("json");
            assert_eq!(response["status"], "success");
            assert_eq!(response["result"]["echo"]["q"], "same");
        }
        assert_eq!(
            calls.action_calls.load(Ordering::Relaxed),
            1,
            "repeated read actions must be served from cache"
        );

        let unknown: Value = http
            .post(format!("{url}/action"))
            .json(&json!({"action": "nope", "params": {}, "credentials": {}}))
            .send()
            .await
            .expect("action")
            .json()
            .await
            .expect("json");
        assert_eq!(unknown["status"], "error");
    }
}
