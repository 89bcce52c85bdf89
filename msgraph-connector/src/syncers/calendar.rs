use async_trait::async_trait;
use common::error::AppError;
use connector_sdk::SyncContext;
use serde_json::Value;
use tracing::{info, warn};

use crate::client::GraphClient;
use crate::mappers::{generate_event_content, map_event_to_document};

use super::Syncer;

const EVENT_SELECT: &str =
    "id,subject,body,start,end,organizer,attendees,webLink,createdDateTime,lastModifiedDateTime";

/// Outlook calendar events via delta queries.
pub struct CalendarSyncer;

#[async_trait]
impl Syncer for CalendarSyncer {
    fn name(&self) -> &'static str {
        "calendar"
    }

    async fn sync_for_user(
        &self,
        client: &GraphClient,
        user: &Value,
        ctx: &SyncContext,
        delta_token: Option<String>,
    ) -> Result<Option<String>, AppError> {
        let user_id = user["id"].as_str().unwrap_or_default();
        let display_name = user["displayName"].as_str().unwrap_or(user_id);
        info!(user = display_name, "syncing calendar");

        let (items, new_token) = match client
            .get_delta(
                &format!("/users/{user_id}/events/delta"),
                delta_token.as_deref(),
                Some(EVENT_SELECT),
            )
            .await
        {
            Ok(result) => result,
            Err(err) => {
                warn!(user = display_name, error = %err, "failed to fetch calendar delta");
                return Ok(delta_token);
            }
        };

        let user_email = user["mail"]
            .as_str()
            .or_else(|| user["userPrincipalName"].as_str());

        for item in &items {
            if ctx.is_cancelled() {
                return Ok(delta_token);
            }
            ctx.increment_scanned().await?;

            let item_id = item["id"].as_str().unwrap_or("unknown");
            if !item["@removed"].is_null() {
                ctx.emit_deleted(&format!("calendar:{user_id}:{item_id}"))
                    .await?;
                continue;
            }

            let result: Result<(), AppError> = async {
                let content = generate_event_content(item);
                let content_id = ctx.save_content(&content, "text/plain").await?;
                ctx.emit(map_event_to_document(item, user_id, user_email, content_id))
                    .await
            }
            .await;

            if let Err(err) = result {
                let external_id = format!("calendar:{user_id}:{item_id}");
                warn!(%external_id, error = %err, "error processing event");
                ctx.emit_error(&external_id, &err.to_string());
            }
        }

        Ok(new_token.or(delta_token))
    }
}
