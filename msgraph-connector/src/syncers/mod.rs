pub mod calendar;
pub mod drive;
pub mod mail;

use std::collections::HashMap;

use async_trait::async_trait;
use common::error::AppError;
use connector_sdk::SyncContext;
use serde_json::Value;
use tracing::{info, warn};

use crate::client::GraphClient;

/// Per-user delta tokens for one sub-resource.
pub type SyncerState = HashMap<String, String>;

/// One Graph sub-resource walked per user with delta queries.
///
/// `sync_for_user` returns the new delta token for that user, or the old one
/// when the walk could not finish; the caller folds tokens into connector
/// state so a token is never rewound by a failed pass.
#[async_trait]
pub trait Syncer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn sync_for_user(
        &self,
        client: &GraphClient,
        user: &Value,
        ctx: &SyncContext,
        delta_token: Option<String>,
    ) -> Result<Option<String>, AppError>;

    /// Walk every tenant user. Cancellation is honored between users; the
    /// partial state accumulated so far is returned either way.
    async fn sync(
        &self,
        client: &GraphClient,
        ctx: &SyncContext,
        state: &SyncerState,
    ) -> Result<SyncerState, AppError> {
        let users = client.list_users().await?;
        info!(syncer = self.name(), users = users.len(), "walking tenant users");

        let mut new_state = state.clone();
        for user in &users {
            if ctx.is_cancelled() {
                return Ok(new_state);
            }
            let Some(user_id) = user.get("id").and_then(Value::as_str) else {
                continue;
            };
            let previous = state.get(user_id).cloned();
            match self.sync_for_user(client, user, ctx, previous).await {
                Ok(Some(token)) => {
                    new_state.insert(user_id.to_string(), token);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(syncer = self.name(), user_id, error = %err, "user walk failed");
                    ctx.emit_error(&format!("{}:{user_id}:*", self.name()), &err.to_string());
                }
            }
        }
        Ok(new_state)
    }
}
