use std::time::Duration;

use common::error::AppError;
use serde_json::{json, Value};
use tracing::debug;

use crate::models::{EventPayload, SyncConfig};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the connector-manager SDK surface. One instance per
/// connector process; every context method ultimately goes through here.
pub struct ManagerClient {
    base_url: String,
    http: reqwest::Client,
}

impl ManagerClient {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(AppError::Validation(
                "connector manager base url must not be empty".into(),
            ));
        }
        Ok(Self {
            base_url,
            http: reqwest::Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .pool_max_idle_per_host(10)
                .build()?,
        })
    }

    /// Read `CONNECTOR_MANAGER_URL` from the environment.
    pub fn from_env() -> Result<Self, AppError> {
        let base_url = std::env::var("CONNECTOR_MANAGER_URL").map_err(|_| {
            AppError::Validation("CONNECTOR_MANAGER_URL environment variable not set".into())
        })?;
        Self::new(&base_url)
    }

    pub async fn fetch_sync_config(&self, source_id: &str) -> Result<SyncConfig, AppError> {
        let response = self
            .http
            .get(format!("{}/sdk/source/{source_id}/sync-config", self.base_url))
            .send()
            .await?;
        let response = check(response, "fetch sync config").await?;
        Ok(response.json().await?)
    }

    pub async fn emit_event(
        &self,
        sync_run_id: &str,
        source_id: &str,
        event: &EventPayload,
    ) -> Result<(), AppError> {
        debug!(%sync_run_id, "emitting connector event");
        let response = self
            .http
            .post(format!("{}/sdk/events", self.base_url))
            .json(&json!({
                "sync_run_id": sync_run_id,
                "source_id": source_id,
                "event": event,
            }))
            .send()
            .await?;
        check(response, "emit event").await?;
        Ok(())
    }

    pub async fn store_content(
        &self,
        sync_run_id: &str,
        content: &str,
        content_type: &str,
    ) -> Result<String, AppError> {
        debug!(%sync_run_id, "storing content");
        let response = self
            .http
            .post(format!("{}/sdk/content", self.base_url))
            .json(&json!({
                "sync_run_id": sync_run_id,
                "content": content,
                "content_type": content_type,
            }))
            .send()
            .await?;
        let response = check(response, "store content").await?;
        let body: Value = response.json().await?;
        body.get("content_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::InternalError("content response missing content_id".into()))
    }

    pub async fn heartbeat(&self, sync_run_id: &str) -> Result<(), AppError> {
        let response = self
            .http
            .post(format!("{}/sdk/sync/{sync_run_id}/heartbeat", self.base_url))
            .send()
            .await?;
        check(response, "heartbeat").await?;
        Ok(())
    }

    pub async fn increment_scanned(&self, sync_run_id: &str) -> Result<(), AppError> {
        let response = self
            .http
            .post(format!("{}/sdk/sync/{sync_run_id}/scanned", self.base_url))
            .send()
            .await?;
        check(response, "increment scanned").await?;
        Ok(())
    }

    /// Checkpoint connector state mid-sync so a cancelled or crashed run can
    /// resume from it.
    pub async fn save_state(&self, sync_run_id: &str, state: &Value) -> Result<(), AppError> {
        let response = self
            .http
            .post(format!("{}/sdk/sync/{sync_run_id}/state", self.base_url))
            .json(&json!({ "state": state }))
            .send()
            .await?;
        check(response, "save state").await?;
        Ok(())
    }

    pub async fn complete(
        &self,
        sync_run_id: &str,
        documents_scanned: u64,
        documents_updated: u64,
        new_state: Option<&Value>,
    ) -> Result<(), AppError> {
        let mut payload = json!({
            "documents_scanned": documents_scanned,
            "documents_updated": documents_updated,
        });
        if let (Some(state), Some(map)) = (new_state, payload.as_object_mut()) {
            map.insert("new_state".into(), state.clone());
        }
        let response = self
            .http
            .post(format!("{}/sdk/sync/{sync_run_id}/complete", self.base_url))
            .json(&payload)
            .send()
            .await?;
        check(response, "complete sync").await?;
        Ok(())
    }

    pub async fn fail(&self, sync_run_id: &str, error: &str) -> Result<(), AppError> {
        let response = self
            .http
            .post(format!("{}/sdk/sync/{sync_run_id}/fail", self.base_url))
            .json(&json!({ "error": error }))
            .send()
            .await?;
        check(response, "fail sync").await?;
        Ok(())
    }
}

async fn check(response: reqwest::Response, operation: &str) -> Result<reqwest::Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match status.as_u16() {
        404 => Err(AppError::NotFound(format!("{operation}: {body}"))),
        code => Err(AppError::Api {
            status: code,
            message: format!("{operation}: {body}"),
        }),
    }
}
