use crate::{error::AppError, storage::db::SurrealDbClient, stored_object, utils::id::new_id};

stored_object!(ServiceCredentials, "service_credentials", {
    source_id: String,
    /// Secret bundle for the connector: bearer token, OAuth client data,
    /// tenant/client/secret triples. Shape is connector-specific.
    secret: serde_json::Value,
});

impl ServiceCredentials {
    pub fn new(source_id: String, secret: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            created_at: now,
            updated_at: now,
            source_id,
            secret,
        }
    }

    /// Latest credentials bound to a source, fetched once per sync run.
    pub async fn get_for_source(
        db: &SurrealDbClient,
        source_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut result = db
            .query(format!(
                "SELECT * FROM {} WHERE source_id = $source_id ORDER BY created_at DESC LIMIT 1",
                Self::table_name()
            ))
            .bind(("source_id", source_id.to_string()))
            .await?;
        let creds: Vec<Self> = result.take(0)?;
        Ok(creds.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn latest_credentials_win() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        let old = ServiceCredentials::new("src-1".into(), json!({"token": "old"}));
        db.store_item(old).await.expect("store old");

        // Later rotation should shadow the original bundle
        let mut newer = ServiceCredentials::new("src-1".into(), json!({"token": "new"}));
        newer.created_at = Utc::now() + chrono::Duration::seconds(5);
        db.store_item(newer).await.expect("store new");

        let fetched = ServiceCredentials::get_for_source(&db, "src-1")
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(fetched.secret, json!({"token": "new"}));

        let missing = ServiceCredentials::get_for_source(&db, "src-2")
            .await
            .expect("fetch");
        assert!(missing.is_none());
    }
}
