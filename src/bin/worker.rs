use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use studydesk::{
    clock::SystemClock, config::AppConfig, db, extract::HttpDocumentExtractor,
    llm::HttpGenerationClient, state::AppState, Worker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        pool_size = 1,
        batch_size = config.worker_batch_size,
        runtime_budget_seconds = config.worker_runtime_budget_seconds,
        "loaded configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let generator = Arc::new(HttpGenerationClient::from_config(&config));
    let extractor = Arc::new(HttpDocumentExtractor::from_config(&config));

    let state = Arc::new(AppState::new(
        pool,
        config,
        generator,
        extractor,
        Arc::new(SystemClock),
    ));
    let worker_id = format!("worker-{}", Uuid::new_v4());
    let worker = Worker::new(state, worker_id);

    tokio::select! {
        _ = worker.run() => {}
        _ = signal::ctrl_c() => {
            tracing::info!("worker received shutdown signal");
        }
    }

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
