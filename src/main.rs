//! Orchidarium Binary Entry Point
//!
//! This binary runs the complete orchidarium daemon. Core functionality
//! is provided by the `orchidarium` library crate.

use clap::Parser;
use orchidarium::{
    config::AppConfig, daemon::Daemon, health::HealthStore, publisher, sensor::SensorRegistry,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Orchidarium - Greenhouse Sensor Daemon
#[derive(Parser, Debug)]
#[command(name = "orchidarium", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "ORCHIDARIUM_CONFIG"
    )]
    config: String,

    /// Server port (overrides config file)
    #[arg(long, env = "ORCHIDARIUM_PORT")]
    port: Option<u16>,

    /// Health record directory (overrides config file)
    #[arg(long, env = "ORCHIDARIUM_RECORDS_DIR")]
    records_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchidarium=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Orchidarium - Greenhouse Sensor Daemon");

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration; a missing file falls back to defaults
    tracing::info!("Loading configuration from: {}", cli.config);
    let mut config = AppConfig::load_or_default(&cli.config)?;

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(records_dir) = cli.records_dir {
        config.health.records_dir = records_dir;
    }
    config.validate()?;

    tracing::info!(
        "Server: {}:{}, records: {}",
        config.server.bind,
        config.server.port,
        config.health.records_dir,
    );

    let store = HealthStore::open(config.health.records_dir.as_str(), config.health.cache_ttl)?;
    let registry = SensorRegistry::from_config(&config.sensors, config.bus, &store);
    let make_publisher = publisher::factory(&config.publisher);
    let daemon = Daemon::new(registry, store, make_publisher, &config);

    // Cancel the daemon on Ctrl+C or SIGTERM
    let shutdown = daemon.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    daemon.run().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
