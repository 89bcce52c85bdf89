use async_trait::async_trait;
use common::error::AppError;
use connector_sdk::SyncContext;
use serde_json::Value;
use tracing::{info, warn};

use crate::client::GraphClient;
use crate::mappers::{generate_drive_item_content, map_drive_item_to_document};

use super::Syncer;

const ITEM_SELECT: &str = "id,name,file,folder,size,webUrl,lastModifiedDateTime,\
createdDateTime,parentReference";

const INDEXABLE_MIME_PREFIXES: &[&str] = &["text/", "application/pdf", "application/json"];
const INDEXABLE_EXTENSIONS: &[&str] = &[
    ".txt", ".md", ".csv", ".json", ".xml", ".html", ".htm", ".pdf", ".doc", ".docx", ".xls",
    ".xlsx", ".ppt", ".pptx", ".rtf", ".odt", ".ods", ".odp",
];

/// OneDrive files via delta queries. Indexable files get their bodies
/// downloaded; everything else is indexed by its metadata.
pub struct DriveSyncer;

#[async_trait]
impl Syncer for DriveSyncer {
    fn name(&self) -> &'static str {
        "onedrive"
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
        info!(user = display_name, "syncing drive");

        let (items, new_token) = match client
            .get_delta(
                &format!("/users/{user_id}/drive/root/delta"),
                delta_token.as_deref(),
                Some(ITEM_SELECT),
            )
            .await
        {
            Ok(result) => result,
            Err(err) => {
                warn!(user = display_name, error = %err, "failed to fetch drive delta");
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
            let drive_id = item["parentReference"]["driveId"].as_str().unwrap_or("unknown");
            if !item["deleted"].is_null() || !item["@removed"].is_null() {
                ctx.emit_deleted(&format!("onedrive:{drive_id}:{item_id}"))
                    .await?;
                continue;
            }
            if !item["folder"].is_null() {
                continue;
            }

            let result: Result<(), AppError> = async {
                let content = self.content_for(client, item).await;
                let content_id = ctx.save_content(&content, "text/plain").await?;
                ctx.emit(map_drive_item_to_document(item, content_id, user_email))
                    .await
            }
            .await;

            if let Err(err) = result {
                let external_id = format!("onedrive:{drive_id}:{item_id}");
                warn!(%external_id, error = %err, "error processing drive item");
                ctx.emit_error(&external_id, &err.to_string());
            }
        }

        Ok(new_token.or(delta_token))
    }
}

impl DriveSyncer {
    /// File body for indexable types, metadata summary otherwise; download
    /// failures fall back to metadata.
    async fn content_for(&self, client: &GraphClient, item: &Value) -> String {
        let mime_type = item["file"]["mimeType"].as_str().unwrap_or_default();
        let name = item["name"].as_str().unwrap_or_default();

        if !is_indexable(mime_type, &extension_of(name)) {
            return generate_drive_item_content(item);
        }

        let Some(drive_id) = item["parentReference"]["driveId"].as_str() else {
            return generate_drive_item_content(item);
        };
        let item_id = item["id"].as_str().unwrap_or_default();

        match client
            .get_binary(&format!("/drives/{drive_id}/items/{item_id}/content"))
            .await
        {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => {
                warn!(item_id, error = %err, "content download failed, indexing metadata");
                generate_drive_item_content(item)
            }
        }
    }
}

fn extension_of(filename: &str) -> String {
    filename
        .rfind('.')
        .map(|idx| filename[idx..].to_lowercase())
        .unwrap_or_default()
}

fn is_indexable(mime_type: &str, extension: &str) -> bool {
    INDEXABLE_MIME_PREFIXES
        .iter()
        .any(|prefix| mime_type.starts_with(prefix))
        || INDEXABLE_EXTENSIONS.contains(&extension)
}
