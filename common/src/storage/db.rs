use std::ops::Deref;

use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

use crate::error::AppError;

use super::types::StoredObject;

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        db.signin(Root { username, password }).await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Apply the schema this service relies on. Safe to run on every boot.
    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        self.build_indexes().await?;
        Ok(())
    }

    pub async fn build_indexes(&self) -> Result<(), Error> {
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_document_source_external ON document FIELDS source_id, external_id UNIQUE")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_document_status ON document FIELDS embedding_status")
            .await?;

        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_queue_document ON embedding_queue FIELDS document_id UNIQUE")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_queue_status ON embedding_queue FIELDS status")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_queue_created ON embedding_queue FIELDS created_at")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_queue_batch ON embedding_queue FIELDS batch_job_id")
            .await?;

        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_event_consumed ON connector_event FIELDS consumed")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_embedding_document ON embedding FIELDS document_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_sync_run_source ON sync_run FIELDS source_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_sync_run_status ON sync_run FIELDS status")
            .await?;

        Ok(())
    }

    /// Vector index over chunk embeddings; dimension comes from the active
    /// provider, so this runs after provider initialization rather than in
    /// `build_indexes`. The search subsystem reads through this index.
    pub async fn ensure_vector_index(&self, dimensions: usize) -> Result<(), Error> {
        self.client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_embedding_vector ON embedding FIELDS embedding HNSW DIMENSION {dimensions}"
            ))
            .await?;
        Ok(())
    }

    /// Store an object under its own id.
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }

}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}

#[cfg(test)]
mod tests {
    use crate::stored_object;

    use super::*;
    use uuid::Uuid;

    stored_object!(Dummy, "dummy", {
        name: String
    });

    #[tokio::test]
    async fn test_initialization_and_crud() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.ensure_initialized()
            .await
            .expect("Failed to initialize schema");
        db.ensure_vector_index(8)
            .await
            .expect("Failed to define vector index");

        let dummy = Dummy {
            id: "abc".to_string(),
            name: "first".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let stored = db.store_item(dummy.clone()).await.expect("Failed to store");
        assert!(stored.is_some());

        let fetched = db
            .get_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to fetch");
        assert_eq!(fetched, Some(dummy.clone()));

        let all = db
            .get_all_stored_items::<Dummy>()
            .await
            .expect("Failed to fetch all");
        assert!(all.contains(&dummy));

        let deleted = db
            .delete_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to delete");
        assert_eq!(deleted, Some(dummy));

        let fetch_post = db
            .get_item::<Dummy>("abc")
            .await
            .expect("Failed fetch post delete");
        assert!(fetch_post.is_none());
    }
}
