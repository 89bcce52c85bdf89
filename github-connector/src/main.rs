use std::sync::Arc;

use connector_sdk::{connector_app, ManagerClient};
use github_connector::GitHubConnector;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let port: u16 = std::env::var("CONNECTOR_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8081);
    let max_concurrent_syncs: usize = std::env::var("MAX_CONCURRENT_SYNCS_PER_TYPE")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(3);

    let client = Arc::new(ManagerClient::from_env()?);
    let app = connector_app(Arc::new(GitHubConnector), client, max_concurrent_syncs);

    let address = format!("0.0.0.0:{port}");
    info!(%address, "starting GitHub connector runtime");
    let listener = tokio::net::TcpListener::bind(&address).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
