use anyhow::Context;
use fleetgate::{
    utils::{config::Config, logging::init_logging},
    Application,
};
use tokio::signal;
use tracing::{error, info};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // Load configuration
    let config = Config::new().context("Failed to load configuration")?;
    let _log_guard = init_logging(&config.node);

    info!("Starting fleetgate v{}", env!("CARGO_PKG_VERSION"));

    let app = Application::new(config).map_err(|e| {
        error!("Failed to initialize application: {}", e);
        e
    })?;

    let addrs = app.start().await.map_err(|e| {
        error!("Failed to start application: {}", e);
        e
    })?;
    info!(?addrs, "Application started successfully");

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }

    // Perform graceful shutdown
    if let Err(e) = app.shutdown().await {
        error!("Error during shutdown: {}", e);
    }
    Ok(())
}
