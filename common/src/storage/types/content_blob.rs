use bytes::Bytes;

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, store::StorageManager},
    stored_object,
    utils::id::new_id,
};

stored_object!(ContentBlob, "content_blob", {
    content_type: String,
    storage_key: String,
    storage_backend: String,
});

impl ContentBlob {
    /// Store content bytes and the row describing them. Blobs are immutable:
    /// a changed document body gets a fresh content id, never an overwrite.
    ///
    /// The object write happens before the row, so a crash in between leaves
    /// an unreferenced object rather than a row pointing at nothing.
    pub async fn save(
        db: &SurrealDbClient,
        storage: &StorageManager,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, AppError> {
        let id = new_id();
        let storage_key = format!("content/{id}");

        storage.put(&storage_key, bytes).await?;

        let now = Utc::now();
        let blob = Self {
            id: id.clone(),
            created_at: now,
            updated_at: now,
            content_type: content_type.to_string(),
            storage_key,
            storage_backend: format!("{:?}", storage.backend_kind()).to_lowercase(),
        };
        db.store_item(blob).await?;

        Ok(id)
    }

    pub async fn load(
        db: &SurrealDbClient,
        storage: &StorageManager,
        content_id: &str,
    ) -> Result<(Self, Bytes), AppError> {
        let blob: Self = db
            .get_item(content_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("content blob {content_id}")))?;

        let bytes = storage.get(&blob.storage_key).await?;
        Ok((blob, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::testing::memory_storage;
    use uuid::Uuid;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        let storage = memory_storage();

        let body = Bytes::from_static(b"# README\n\nHello.");
        let content_id = ContentBlob::save(&db, &storage, body.clone(), "text/markdown")
            .await
            .expect("save");
        assert_eq!(content_id.len(), 26);

        let (blob, bytes) = ContentBlob::load(&db, &storage, &content_id)
            .await
            .expect("load");
        assert_eq!(bytes, body);
        assert_eq!(blob.content_type, "text/markdown");
        assert_eq!(blob.storage_key, format!("content/{content_id}"));
    }

    #[tokio::test]
    async fn ids_are_issued_in_order() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        let storage = memory_storage();

        let a = ContentBlob::save(&db, &storage, Bytes::from_static(b"a"), "text/plain")
            .await
            .expect("save a");
        let b = ContentBlob::save(&db, &storage, Bytes::from_static(b"b"), "text/plain")
            .await
            .expect("save b");
        assert!(a < b, "content ids must be monotonically issued");
    }

    #[tokio::test]
    async fn unknown_content_id_is_not_found() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        let storage = memory_storage();

        let err = ContentBlob::load(&db, &storage, "01JUNKJUNKJUNKJUNKJUNKJUNK")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
