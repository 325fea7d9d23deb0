use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use studydesk::{
    clock::SystemClock, config::AppConfig, db, extract::HttpDocumentExtractor,
    llm::HttpGenerationClient, routes, state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "server",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        model = %config.model_name,
        prompt_version = %config.prompt_version,
        "loaded configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let generator = Arc::new(HttpGenerationClient::from_config(&config));
    let extractor = Arc::new(HttpDocumentExtractor::from_config(&config));

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let state = AppState::new(pool, config, generator, extractor, Arc::new(SystemClock));
    let router = routes::create_router(state);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
