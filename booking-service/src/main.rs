use anyhow::Result;
use booking_service::notify::LogGateway;
use booking_service::{logging, open_storage, BookingApp, ServiceConfig};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init()?;

    let config = ServiceConfig::from_env()?;
    let storage = open_storage(&config.database_url, config.queue.store_options()).await?;
    let app = BookingApp::with_storage(&config, storage, Arc::new(LogGateway))?;

    let running = app.start()?;
    info!("booking service running; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    running.shutdown().await?;
    Ok(())
}
