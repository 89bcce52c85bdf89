use async_trait::async_trait;
use common::error::AppError;
use connector_sdk::SyncContext;
use serde_json::Value;
use tracing::{info, warn};

use crate::client::GraphClient;
use crate::mappers::{generate_message_content, map_message_to_document, strip_html};

use super::Syncer;

const MESSAGE_SELECT: &str = "id,subject,bodyPreview,body,from,toRecipients,\
ccRecipients,receivedDateTime,sentDateTime,webLink,hasAttachments";

/// Outlook inbox via delta queries.
pub struct MailSyncer;

#[async_trait]
impl Syncer for MailSyncer {
    fn name(&self) -> &'static str {
        "mail"
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
        info!(user = display_name, "syncing inbox");

        let (items, new_token) = match client
            .get_delta(
                &format!("/users/{user_id}/mailFolders/inbox/messages/delta"),
                delta_token.as_deref(),
                Some(MESSAGE_SELECT),
            )
            .await
        {
            Ok(result) => result,
            Err(err) => {
                warn!(user = display_name, error = %err, "failed to fetch mail delta");
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
            if !item["@removed"].is_null() || item["deleted"].as_bool().unwrap_or(false) {
                ctx.emit_deleted(&format!("mail:{user_id}:{item_id}")).await?;
                continue;
            }

            let result: Result<(), AppError> = async {
                let body = item["body"]["content"].as_str().unwrap_or_default();
                let body_type = item["body"]["contentType"].as_str().unwrap_or("text");
                let body_text = if body_type.eq_ignore_ascii_case("html") {
                    strip_html(body)
                } else {
                    body.to_string()
                };

                let content = generate_message_content(item, &body_text);
                let content_id = ctx.save_content(&content, "text/plain").await?;
                ctx.emit(map_message_to_document(item, user_id, user_email, content_id))
                    .await
            }
            .await;

            if let Err(err) = result {
                let external_id = format!("mail:{user_id}:{item_id}");
                warn!(%external_id, error = %err, "error processing message");
                ctx.emit_error(&external_id, &err.to_string());
            }
        }

        Ok(new_token.or(delta_token))
    }
}
