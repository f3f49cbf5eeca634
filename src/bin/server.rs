//! novelforge API server

use novelforge::api::{start_server, AppState};
use novelforge::Settings;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;
    info!(
        "Starting novelforge (db: {}, embeddings: {}, rerank: {}, mock_llm: {})",
        settings.db_path, settings.embeddings_provider, settings.rerank_provider, settings.mock_llm
    );

    let host = settings.server_host.clone();
    let port = settings.server_port;
    let state = AppState::new(settings).await?;
    start_server(state, &host, port).await?;
    Ok(())
}
