use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::error::AppError;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::ManagerClient;
use crate::models::{Document, EventPayload};

/// Handle given to a running connector: emit documents, store content,
/// checkpoint state, watch for cancellation, finish the run.
///
/// Every emission and counter update doubles as a heartbeat on the manager
/// side, which is what keeps the run out of the stale-sync reaper's hands.
pub struct SyncContext {
    client: Arc<ManagerClient>,
    sync_run_id: String,
    source_id: String,
    cancel: CancellationToken,
    scanned: AtomicU64,
    emitted: AtomicU64,
}

impl SyncContext {
    pub fn new(client: Arc<ManagerClient>, sync_run_id: String, source_id: String) -> Self {
        Self {
            client,
            sync_run_id,
            source_id,
            cancel: CancellationToken::new(),
            scanned: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
        }
    }

    pub fn sync_run_id(&self) -> &str {
        &self.sync_run_id
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn documents_scanned(&self) -> u64 {
        self.scanned.load(Ordering::Relaxed)
    }

    pub fn documents_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Connectors poll this between entities and between pages.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal cancellation; the connector notices at its next poll point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Emit a newly discovered document.
    pub async fn emit(&self, document: Document) -> Result<(), AppError> {
        self.send_event(document.into_payload(false)).await?;
        self.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Emit an update for a document seen in an earlier run.
    pub async fn emit_updated(&self, document: Document) -> Result<(), AppError> {
        self.send_event(document.into_payload(true)).await?;
        self.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Emit a tombstone for a document deleted upstream.
    pub async fn emit_deleted(&self, external_id: &str) -> Result<(), AppError> {
        self.send_event(EventPayload::DocumentDeleted {
            document_id: external_id.to_string(),
        })
        .await
    }

    /// Record a non-fatal per-document error; the sync continues.
    pub fn emit_error(&self, external_id: &str, error: &str) {
        warn!(
            sync_run_id = %self.sync_run_id,
            external_id,
            error,
            "document error"
        );
    }

    pub async fn increment_scanned(&self) -> Result<(), AppError> {
        self.scanned.fetch_add(1, Ordering::Relaxed);
        self.client.increment_scanned(&self.sync_run_id).await
    }

    /// Store a document body; returns the content id to reference from the
    /// emitted document. Binary payloads are base64-encoded by the caller.
    pub async fn save_content(
        &self,
        content: &str,
        content_type: &str,
    ) -> Result<String, AppError> {
        self.client
            .store_content(&self.sync_run_id, content, content_type)
            .await
    }

    /// Checkpoint state for resumability; call periodically on long syncs.
    pub async fn save_state(&self, state: &Value) -> Result<(), AppError> {
        self.client.save_state(&self.sync_run_id, state).await
    }

    /// Mark the sync completed, persisting the final state.
    pub async fn complete(&self, new_state: Option<&Value>) -> Result<(), AppError> {
        info!(sync_run_id = %self.sync_run_id, "completing sync");
        self.client
            .complete(
                &self.sync_run_id,
                self.documents_scanned(),
                self.documents_emitted(),
                new_state,
            )
            .await
    }

    /// Mark the sync failed with an error message.
    pub async fn fail(&self, error: &str) -> Result<(), AppError> {
        info!(sync_run_id = %self.sync_run_id, error, "failing sync");
        self.client.fail(&self.sync_run_id, error).await
    }

    async fn send_event(&self, payload: EventPayload) -> Result<(), AppError> {
        self.client
            .emit_event(&self.sync_run_id, &self.source_id, &payload)
            .await
    }
}
