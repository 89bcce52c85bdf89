use crate::{error::AppError, storage::db::SurrealDbClient, stored_object, utils::id::new_id};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DocumentCreated,
    DocumentUpdated,
    DocumentDeleted,
}

/// Access tuples forwarded from the source system; evaluation happens in the
/// search layer, the pipeline only carries them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentPermissions {
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
}

/// Wire form of a connector emission, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    DocumentCreated {
        document_id: String,
        content_id: String,
        #[serde(default)]
        metadata: Option<DocumentMetadata>,
        #[serde(default)]
        permissions: Option<DocumentPermissions>,
        #[serde(default)]
        attributes: Option<serde_json::Value>,
    },
    DocumentUpdated {
        document_id: String,
        content_id: String,
        #[serde(default)]
        metadata: Option<DocumentMetadata>,
        #[serde(default)]
        permissions: Option<DocumentPermissions>,
        #[serde(default)]
        attributes: Option<serde_json::Value>,
    },
    DocumentDeleted {
        document_id: String,
    },
}

stored_object!(ConnectorEvent, "connector_event", {
    sync_run_id: String,
    source_id: String,
    event_type: EventType,
    /// External id of the document within its source.
    document_id: String,
    content_id: Option<String>,
    metadata: Option<DocumentMetadata>,
    permissions: Option<DocumentPermissions>,
    attributes: Option<serde_json::Value>,
    consumed: bool,
});

impl ConnectorEvent {
    pub fn from_payload(sync_run_id: String, source_id: String, payload: EventPayload) -> Self {
        let now = Utc::now();
        let (event_type, document_id, content_id, metadata, permissions, attributes) =
            match payload {
                EventPayload::DocumentCreated {
                    document_id,
                    content_id,
                    metadata,
                    permissions,
                    attributes,
                } => (
                    EventType::DocumentCreated,
                    document_id,
                    Some(content_id),
                    metadata,
                    permissions,
                    attributes,
                ),
                EventPayload::DocumentUpdated {
                    document_id,
                    content_id,
                    metadata,
                    permissions,
                    attributes,
                } => (
                    EventType::DocumentUpdated,
                    document_id,
                    Some(content_id),
                    metadata,
                    permissions,
                    attributes,
                ),
                EventPayload::DocumentDeleted { document_id } => (
                    EventType::DocumentDeleted,
                    document_id,
                    None,
                    None,
                    None,
                    None,
                ),
            };

        Self {
            id: new_id(),
            created_at: now,
            updated_at: now,
            sync_run_id,
            source_id,
            event_type,
            document_id,
            content_id,
            metadata,
            permissions,
            attributes,
            consumed: false,
        }
    }

    /// Durably append an event; it stays until the indexing side consumes it.
    pub async fn append(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.store_item(self.clone()).await?;
        Ok(())
    }

    /// Oldest unconsumed events, in commit order.
    pub async fn next_unconsumed(
        db: &SurrealDbClient,
        limit: usize,
    ) -> Result<Vec<Self>, AppError> {
        let mut result = db
            .query(format!(
                "SELECT * FROM {} WHERE consumed = false ORDER BY created_at ASC LIMIT $limit",
                Self::table_name()
            ))
            .bind(("limit", limit))
            .await?;
        let events: Vec<Self> = result.take(0)?;
        Ok(events)
    }

    pub async fn mark_consumed(db: &SurrealDbClient, id: &str) -> Result<(), AppError> {
        db.query(format!(
            "UPDATE type::thing('{}', $id) SET consumed = true, updated_at = time::now()",
            Self::table_name()
        ))
        .bind(("id", id.to_string()))
        .await?;
        Ok(())
    }

    pub async fn count_for_sync_run(
        db: &SurrealDbClient,
        sync_run_id: &str,
    ) -> Result<usize, AppError> {
        let mut result = db
            .query(format!(
                "SELECT count() AS total FROM {} WHERE sync_run_id = $sync_run_id GROUP ALL",
                Self::table_name()
            ))
            .bind(("sync_run_id", sync_run_id.to_string()))
            .await?;
        #[derive(Deserialize)]
        struct Count {
            total: usize,
        }
        let counts: Vec<Count> = result.take(0)?;
        Ok(counts.first().map_or(0, |c| c.total))
    }
}
