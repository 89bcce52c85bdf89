use std::sync::Arc;

use api_router::api_state::ApiState;
use common::{
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::config::get_config,
};
use embedding_pipeline::{
    dispatcher::{EmbeddingDispatcher, DEFAULT_QUEUE_CAPACITY},
    provider::provider_from_config,
    tokenizer_from_config,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// HTTP surface only; the embedding worker runs as its own process.
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

    let state = ApiState::new(db, config.clone(), storage, dispatcher);
    let app = api_router::app(state);

    let serve_address = format!("0.0.0.0:{}", config.http_port);
    info!("Starting server listening on {serve_address}");
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            shutdown.cancel();
        })
        .await?;
    Ok(())
}
