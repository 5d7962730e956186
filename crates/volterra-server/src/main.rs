//! # Volterra Server
//!
//! Worker process for the trajectory pipeline. Every process runs one pool
//! per queue against the shared Redis backends and relays job updates to
//! the clients it holds.

use anyhow::Context;
use tokio::signal;
use tracing::{error, info};
use volterra_config::ConfigLoader;
use volterra_server::app::{App, Backends};
use volterra_server::startup;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Application error: {:#}", e);
        eprintln!("volterra-server: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config_loader = ConfigLoader::from_default_location().context("failed to load configuration")?;
    let config = config_loader.get().await;

    volterra_core::init_tracing(&config.telemetry)?;
    startup::print_banner();
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Some(addr) = &config.telemetry.metrics_addr {
        startup::install_metrics_exporter(addr)?;
    }
    startup::print_startup_info(&config);

    let backends = Backends::redis(&config.jobs).await?;
    let app = App::build(&config, backends);
    app.run(shutdown_signal()).await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
