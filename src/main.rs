//! clinannot - clinical image annotation backend service

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use clinannot::config::Config;
use clinannot::services::image_store::ImageStore;
use clinannot::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting clinannot (clinical image annotation backend)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("Data directory: {}", config.data_dir.display());
    info!("Third opinion policy: {:?}", config.third_opinion_policy);

    // Image store first: creates the data directory tree
    let store = Arc::new(ImageStore::open(&config.data_dir)?);

    let db_path = config.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = clinannot::db::init_database_pool(&db_path).await?;
    info!("Database connection established");

    let state = AppState::new(db_pool, store, config.third_opinion_policy);
    let app = clinannot::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("Listening on http://{}", config.listen_addr);
    info!("Health check: http://{}/health", config.listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
