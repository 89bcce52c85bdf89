use std::sync::Arc;

use common::{
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::config::get_config,
};
use embedding_pipeline::{
    consumer::EventConsumer,
    dispatcher::{EmbeddingDispatcher, DEFAULT_QUEUE_CAPACITY},
    processor::{run_maintenance_loop, OnlineProcessor},
    provider::provider_from_config,
    tokenizer_from_config,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Standalone indexing worker: event consumer, embedding processor and queue
/// maintenance, no HTTP surface.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let tokenizer = tokenizer_from_config(&config)?;
    let provider = provider_from_config(&config, tokenizer)?;
    db.ensure_vector_index(provider.dimensions()).await?;
    let storage = StorageManager::new(&config).await?;

    let shutdown = CancellationToken::new();
    let dispatcher =
        EmbeddingDispatcher::start(provider, DEFAULT_QUEUE_CAPACITY, shutdown.clone());

    let consumer = EventConsumer::new(Arc::clone(&db));
    let consumer_shutdown = shutdown.clone();
    let consumer_task = tokio::spawn(async move { consumer.run(consumer_shutdown).await });

    let maintenance_db = Arc::clone(&db);
    let maintenance_shutdown = shutdown.clone();
    let stale_timeout = config.stale_sync_timeout_minutes;
    tokio::spawn(async move {
        run_maintenance_loop(maintenance_db, stale_timeout, maintenance_shutdown).await;
    });

    let processor = OnlineProcessor::new(
        Arc::clone(&db),
        storage,
        dispatcher,
        config.embedding_max_model_len,
    );
    let processor_shutdown = shutdown.clone();
    let processor_task = tokio::spawn(async move { processor.run(processor_shutdown).await });

    info!("embedding worker running");
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    shutdown.cancel();

    let _ = processor_task.await;
    let _ = consumer_task.await;
    Ok(())
}
