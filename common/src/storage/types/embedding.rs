use crate::{error::AppError, storage::db::SurrealDbClient, stored_object, utils::id::new_id};

stored_object!(Embedding, "embedding", {
    document_id: String,
    chunk_index: u32,
    char_start: usize,
    char_end: usize,
    embedding: Vec<f32>,
    model_name: String,
});

/// One chunk's span and vector, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkVector {
    pub char_start: usize,
    pub char_end: usize,
    pub embedding: Vec<f32>,
}

impl Embedding {
    pub fn new(
        document_id: String,
        chunk_index: u32,
        chunk: ChunkVector,
        model_name: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            created_at: now,
            updated_at: now,
            document_id,
            chunk_index,
            char_start: chunk.char_start,
            char_end: chunk.char_end,
            embedding: chunk.embedding,
            model_name,
        }
    }

    /// Replace a document's chunk vectors in one transaction.
    ///
    /// Chunks are written in order, so for a completed document the spans are
    /// sorted by `chunk_index` and cover a prefix of the content.
    pub async fn store_for_document(
        db: &SurrealDbClient,
        document_id: &str,
        chunks: Vec<ChunkVector>,
        model_name: &str,
    ) -> Result<usize, AppError> {
        let rows: Vec<Self> = chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                Self::new(
                    document_id.to_string(),
                    u32::try_from(index).unwrap_or(u32::MAX),
                    chunk,
                    model_name.to_string(),
                )
            })
            .collect();
        let count = rows.len();

        let mut query = db
            .client
            .query("BEGIN TRANSACTION;")
            .query(format!(
                "DELETE {} WHERE document_id = $document_id;",
                Self::table_name()
            ))
            .bind(("document_id", document_id.to_string()));
        for (index, row) in rows.into_iter().enumerate() {
            query = query
                .query(format!(
                    "CREATE type::thing('{table}', $id_{index}) CONTENT $row_{index};",
                    table = Self::table_name(),
                ))
                .bind((format!("id_{index}"), row.id.clone()))
                .bind((format!("row_{index}"), row));
        }
        let response = query.query("COMMIT TRANSACTION;").await?;
        response.check()?;

        Ok(count)
    }

    pub async fn get_for_document(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut result = db
            .query(format!(
                "SELECT * FROM {} WHERE document_id = $document_id ORDER BY chunk_index ASC",
                Self::table_name()
            ))
            .bind(("document_id", document_id.to_string()))
            .await?;
        let rows: Vec<Self> = result.take(0)?;
        Ok(rows)
    }

    pub async fn delete_for_document(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<(), AppError> {
        db.query(format!(
            "DELETE {} WHERE document_id = $document_id",
            Self::table_name()
        ))
        .bind(("document_id", document_id.to_string()))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn test_db() -> SurrealDbClient {
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    fn chunks_for(text: &str, size: usize) -> Vec<ChunkVector> {
        let mut out = Vec::new();
        let mut start = 0;
        while start < text.len() {
            let end = (start + size).min(text.len());
            out.push(ChunkVector {
                char_start: start,
                char_end: end,
                embedding: vec![0.1; 8],
            });
            start = end;
        }
        out
    }

    #[tokio::test]
    async fn store_and_read_back_in_chunk_order() {
        let db = test_db().await;
        let text = "abcdefghijklmnopqrstuvwxyz";

        let stored = Embedding::store_for_document(&db, "doc-1", chunks_for(text, 10), "test-model")
            .await
            .expect("store");
        assert_eq!(stored, 3);

        let rows = Embedding::get_for_document(&db, "doc-1").await.expect("get");
        assert_eq!(rows.len(), 3);

        // Spans are sorted, contiguous and cover the whole text
        let mut expected_start = 0;
        for row in &rows {
            assert_eq!(row.char_start, expected_start);
            expected_start = row.char_end;
            assert_eq!(row.model_name, "test-model");
        }
        assert_eq!(expected_start, text.len());
    }

    #[tokio::test]
    async fn re_store_replaces_previous_vectors() {
        let db = test_db().await;

        Embedding::store_for_document(&db, "doc-1", chunks_for("aaaa bbbb cccc", 5), "m1")
            .await
            .expect("store v1");
        Embedding::store_for_document(&db, "doc-1", chunks_for("new text", 100), "m2")
            .await
            .expect("store v2");

        let rows = Embedding::get_for_document(&db, "doc-1").await.expect("get");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.first().map(|r| r.model_name.clone()), Some("m2".into()));
    }

    #[tokio::test]
    async fn delete_clears_only_the_target_document() {
        let db = test_db().await;

        Embedding::store_for_document(&db, "doc-1", chunks_for("hello", 5), "m")
            .await
            .expect("store 1");
        Embedding::store_for_document(&db, "doc-2", chunks_for("world", 5), "m")
            .await
            .expect("store 2");

        Embedding::delete_for_document(&db, "doc-1").await.expect("delete");

        assert!(Embedding::get_for_document(&db, "doc-1")
            .await
            .expect("get")
            .is_empty());
        assert_eq!(
            Embedding::get_for_document(&db, "doc-2")
                .await
                .expect("get")
                .len(),
            1
        );
    }
}
