use crate::{error::AppError, storage::db::SurrealDbClient, stored_object, utils::id::new_id};

stored_object!(Source, "source", {
    source_type: String,
    name: String,
    config: serde_json::Value,
    is_active: bool,
    is_deleted: bool,
    created_by: Option<String>,
    /// Opaque replay cursor written by the connector; the pipeline never
    /// interprets it beyond storing and handing it back.
    connector_state: Option<serde_json::Value>,
});

impl Source {
    pub fn new(
        source_type: String,
        name: String,
        config: serde_json::Value,
        created_by: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            created_at: now,
            updated_at: now,
            source_type,
            name,
            config,
            is_active: true,
            is_deleted: false,
            created_by,
            connector_state: None,
        }
    }

    /// Fetch a source that is still usable for syncing.
    pub async fn get_active(db: &SurrealDbClient, id: &str) -> Result<Self, AppError> {
        let source: Option<Self> = db.get_item(id).await?;
        match source {
            Some(source) if !source.is_deleted => Ok(source),
            _ => Err(AppError::NotFound(format!("source {id}"))),
        }
    }

    /// Persist connector state after a checkpoint or completed sync.
    ///
    /// Watermarks inside the state only ever move forward because connectors
    /// fold the previous state into the new one; a failed sync never calls
    /// this with a rewound cursor.
    pub async fn save_connector_state(
        db: &SurrealDbClient,
        id: &str,
        state: serde_json::Value,
    ) -> Result<(), AppError> {
        db.query(format!(
            "UPDATE type::thing('{}', $id) SET connector_state = $state, updated_at = time::now()",
            Self::table_name()
        ))
        .bind(("id", id.to_string()))
        .bind(("state", state))
        .await?;
        Ok(())
    }

    /// Sources are never hard-deleted; documents keep referring to them.
    pub async fn soft_delete(db: &SurrealDbClient, id: &str) -> Result<(), AppError> {
        db.query(format!(
            "UPDATE type::thing('{}', $id) SET is_deleted = true, is_active = false, updated_at = time::now()",
            Self::table_name()
        ))
        .bind(("id", id.to_string()))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    async fn test_db() -> SurrealDbClient {
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    #[tokio::test]
    async fn create_and_fetch_active() {
        let db = test_db().await;
        let source = Source::new(
            "github".into(),
            "Acme GitHub".into(),
            json!({"orgs": ["acme"]}),
            Some("admin".into()),
        );
        let id = source.id.clone();
        db.store_item(source).await.expect("store");

        let fetched = Source::get_active(&db, &id).await.expect("fetch");
        assert_eq!(fetched.source_type, "github");
        assert!(fetched.is_active);
        assert!(fetched.connector_state.is_none());
    }

    #[tokio::test]
    async fn state_round_trip() {
        let db = test_db().await;
        let source = Source::new("github".into(), "s".into(), json!({}), None);
        let id = source.id.clone();
        db.store_item(source).await.expect("store");

        let state = json!({"repos": {"acme/app": {"issues_updated_at": "2024-01-01T00:00:00Z"}}});
        Source::save_connector_state(&db, &id, state.clone())
            .await
            .expect("save state");

        let fetched = Source::get_active(&db, &id).await.expect("fetch");
        assert_eq!(fetched.connector_state, Some(state));
    }

    #[tokio::test]
    async fn soft_deleted_source_is_not_returned() {
        let db = test_db().await;
        let source = Source::new("github".into(), "s".into(), json!({}), None);
        let id = source.id.clone();
        db.store_item(source).await.expect("store");

        Source::soft_delete(&db, &id).await.expect("delete");

        let err = Source::get_active(&db, &id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
