use crate::{error::AppError, storage::db::SurrealDbClient, stored_object, utils::id::new_id};

use super::connector_event::DocumentPermissions;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Canonical fields carried by a create/update event, applied on upsert.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentFields {
    pub title: String,
    pub url: Option<String>,
    pub content_id: Option<String>,
    pub content_type: Option<String>,
    pub attributes: Option<serde_json::Value>,
    pub permissions: DocumentPermissions,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
}

stored_object!(Document, "document", {
    source_id: String,
    /// Stable id within the source; `(source_id, external_id)` is unique.
    external_id: String,
    title: String,
    url: Option<String>,
    content_id: Option<String>,
    content_type: Option<String>,
    attributes: Option<serde_json::Value>,
    permissions: DocumentPermissions,
    source_created_at: Option<DateTime<Utc>>,
    source_updated_at: Option<DateTime<Utc>>,
    embedding_status: EmbeddingStatus,
});

impl Document {
    pub fn new(source_id: String, external_id: String, fields: DocumentFields) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            created_at: now,
            updated_at: now,
            source_id,
            external_id,
            title: fields.title,
            url: fields.url,
            content_id: fields.content_id,
            content_type: fields.content_type,
            attributes: fields.attributes,
            permissions: fields.permissions,
            source_created_at: fields.source_created_at,
            source_updated_at: fields.source_updated_at,
            embedding_status: EmbeddingStatus::Pending,
        }
    }

    /// Idempotent ingest on `(source_id, external_id)`: a repeated emission
    /// refreshes the existing row instead of creating a second one, and drops
    /// `embedding_status` back to `pending` so the new content gets indexed.
    pub async fn upsert_from_event(
        db: &SurrealDbClient,
        source_id: &str,
        external_id: &str,
        fields: DocumentFields,
    ) -> Result<Self, AppError> {
        if let Some(updated) = Self::apply_update(db, source_id, external_id, &fields).await? {
            return Ok(updated);
        }

        let document = Self::new(source_id.to_string(), external_id.to_string(), fields.clone());
        match db.store_item(document.clone()).await {
            Ok(_) => Ok(document),
            // Unique index collision: another writer created the row between
            // our update and create. Their row wins; refresh it.
            Err(err) => match Self::apply_update(db, source_id, external_id, &fields).await? {
                Some(updated) => Ok(updated),
                None => Err(AppError::Database(err)),
            },
        }
    }

    async fn apply_update(
        db: &SurrealDbClient,
        source_id: &str,
        external_id: &str,
        fields: &DocumentFields,
    ) -> Result<Option<Self>, AppError> {
        let mut result = db
            .query(format!(
                "UPDATE {} SET \
                    title = $fields.title, \
                    url = $fields.url, \
                    content_id = $fields.content_id, \
                    content_type = $fields.content_type, \
                    attributes = $fields.attributes, \
                    permissions = $fields.permissions, \
                    source_created_at = $fields.source_created_at, \
                    source_updated_at = $fields.source_updated_at, \
                    embedding_status = 'pending', \
                    updated_at = time::now() \
                 WHERE source_id = $source_id AND external_id = $external_id RETURN AFTER",
                Self::table_name()
            ))
            .bind(("source_id", source_id.to_string()))
            .bind(("external_id", external_id.to_string()))
            .bind(("fields", fields.clone()))
            .await?;
        let updated: Vec<Self> = result.take(0)?;
        Ok(updated.into_iter().next())
    }

    pub async fn find_by_external(
        db: &SurrealDbClient,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut result = db
            .query(format!(
                "SELECT * FROM {} WHERE source_id = $source_id AND external_id = $external_id LIMIT 1",
                Self::table_name()
            ))
            .bind(("source_id", source_id.to_string()))
            .bind(("external_id", external_id.to_string()))
            .await?;
        let documents: Vec<Self> = result.take(0)?;
        Ok(documents.into_iter().next())
    }

    pub async fn set_embedding_status(
        db: &SurrealDbClient,
        id: &str,
        status: EmbeddingStatus,
    ) -> Result<(), AppError> {
        let status_str = match status {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Processing => "processing",
            EmbeddingStatus::Completed => "completed",
            EmbeddingStatus::Failed => "failed",
        };
        db.query(format!(
            "UPDATE type::thing('{}', $id) SET embedding_status = $status, updated_at = time::now()",
            Self::table_name()
        ))
        .bind(("id", id.to_string()))
        .bind(("status", status_str))
        .await?;
        Ok(())
    }

    /// Remove a tombstoned document. Chunk vectors and queue rows are cleaned
    /// up by the caller, which owns the ordering of those deletions.
    pub async fn delete_by_external(
        db: &SurrealDbClient,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut result = db
            .query(format!(
                "DELETE {} WHERE source_id = $source_id AND external_id = $external_id RETURN BEFORE",
                Self::table_name()
            ))
            .bind(("source_id", source_id.to_string()))
            .bind(("external_id", external_id.to_string()))
            .await?;
        let deleted: Vec<Self> = result.take(0)?;
        Ok(deleted.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn test_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("schema");
        db
    }

    fn fields(title: &str) -> DocumentFields {
        DocumentFields {
            title: title.to_string(),
            url: Some("https://example.com/doc".into()),
            content_id: Some("content-1".into()),
            content_type: Some("text/plain".into()),
            permissions: DocumentPermissions {
                public: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn repeated_upsert_keeps_one_row() {
        let db = test_db().await;

        let first = Document::upsert_from_event(&db, "src-1", "gh:issue:1", fields("v1"))
            .await
            .expect("first upsert");
        assert_eq!(first.embedding_status, EmbeddingStatus::Pending);

        // Simulate the processor finishing, then the same document arriving again
        Document::set_embedding_status(&db, &first.id, EmbeddingStatus::Completed)
            .await
            .expect("status");

        let second = Document::upsert_from_event(&db, "src-1", "gh:issue:1", fields("v2"))
            .await
            .expect("second upsert");

        assert_eq!(second.id, first.id, "same external id must reuse the row");
        assert_eq!(second.title, "v2");
        assert_eq!(
            second.embedding_status,
            EmbeddingStatus::Pending,
            "re-ingest resets embedding status"
        );

        let all: Vec<Document> = db.get_all_stored_items().await.expect("all");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn same_external_id_in_other_source_is_distinct() {
        let db = test_db().await;

        let a = Document::upsert_from_event(&db, "src-1", "doc-1", fields("a"))
            .await
            .expect("upsert a");
        let b = Document::upsert_from_event(&db, "src-2", "doc-1", fields("b"))
            .await
            .expect("upsert b");
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn delete_returns_the_removed_row() {
        let db = test_db().await;

        Document::upsert_from_event(&db, "src-1", "doc-1", fields("a"))
            .await
            .expect("upsert");

        let deleted = Document::delete_by_external(&db, "src-1", "doc-1")
            .await
            .expect("delete");
        assert_eq!(deleted.map(|d| d.title), Some("a".to_string()));

        let gone = Document::find_by_external(&db, "src-1", "doc-1")
            .await
            .expect("find");
        assert!(gone.is_none());

        let missing = Document::delete_by_external(&db, "src-1", "doc-1")
            .await
            .expect("delete again");
        assert!(missing.is_none());
    }
}
