use anyhow::Result;
use log::{info, warn};
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;

use vigil::api::RestApi;
use vigil::config;
use vigil::db::{EventStore, MemoryEventStore, PgEventStore};
use vigil::pipeline::PipelineController;

async fn run_app() -> Result<()> {
    // Initialize logging
    env_logger::init();
    info!("Starting video event detection service");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = config::load_config(config_path.as_deref())?;
    info!("Configuration loaded");

    let database_url = config
        .database
        .url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let store: Arc<dyn EventStore> = match database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .connect(&url)
                .await?;
            let store = PgEventStore::new(Arc::new(pool));
            store.setup().await?;
            info!("Connected to event database");
            Arc::new(store)
        }
        None => {
            warn!("No database configured, events are kept in memory only");
            Arc::new(MemoryEventStore::new())
        }
    };

    let controller = Arc::new(PipelineController::new(
        store.clone(),
        config.pipeline.clone(),
    ));

    let api = RestApi::new(&config.api, controller.clone(), store);

    tokio::select! {
        result = api.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            controller.stop().await?;
        }
    }

    info!("Service stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}
