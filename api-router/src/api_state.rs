use std::sync::Arc;

use common::{
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::config::AppConfig,
};
use embedding_pipeline::dispatcher::EmbeddingDispatcher;

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub storage: StorageManager,
    pub dispatcher: EmbeddingDispatcher,
}

impl ApiState {
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: AppConfig,
        storage: StorageManager,
        dispatcher: EmbeddingDispatcher,
    ) -> Self {
        Self {
            db,
            config,
            storage,
            dispatcher,
        }
    }
}
