use std::sync::Arc;

use api_router::api_state::ApiState;
use common::{
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::config::{get_config, EmbeddingBackend},
};
use embedding_pipeline::{
    consumer::EventConsumer,
    dispatcher::{EmbeddingDispatcher, DEFAULT_QUEUE_CAPACITY},
    processor::{run_maintenance_loop, OnlineProcessor},
    provider::provider_from_config,
    tokenizer_from_config,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
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
    info!(
        embedding_backend = ?config.embedding_provider,
        model = provider.model_name(),
        dimensions = provider.dimensions(),
        "Embedding provider initialized"
    );
    db.ensure_vector_index(provider.dimensions()).await?;

    let storage = StorageManager::new(&config).await?;

    let shutdown = CancellationToken::new();
    let dispatcher =
        EmbeddingDispatcher::start(provider, DEFAULT_QUEUE_CAPACITY, shutdown.clone());

    // Background loops: event consumption, embedding work, queue hygiene
    let consumer = EventConsumer::new(Arc::clone(&db));
    let consumer_shutdown = shutdown.clone();
    tokio::spawn(async move { consumer.run(consumer_shutdown).await });

    if config.embedding_provider == EmbeddingBackend::Bedrock {
        // Cloud batch submission needs the AWS transport wired behind
        // BatchInferenceBackend; this build indexes online through the
        // configured gateway instead.
        warn!("bedrock cloud-batch transport not wired in this build; indexing online");
    }
    let processor = OnlineProcessor::new(
        Arc::clone(&db),
        storage.clone(),
        dispatcher.clone(),
        config.embedding_max_model_len,
    );
    let processor_shutdown = shutdown.clone();
    tokio::spawn(async move { processor.run(processor_shutdown).await });

    let maintenance_db = Arc::clone(&db);
    let maintenance_shutdown = shutdown.clone();
    let stale_timeout = config.stale_sync_timeout_minutes;
    tokio::spawn(async move {
        run_maintenance_loop(maintenance_db, stale_timeout, maintenance_shutdown).await;
    });

    // HTTP surface
    let state = ApiState::new(db, config.clone(), storage, dispatcher);
    let app = api_router::app(state);

    let serve_address = format!("0.0.0.0:{}", config.http_port);
    info!("Starting server listening on {serve_address}");
    let listener = tokio::net::TcpListener::bind(serve_address).await?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    Ok(())
}
