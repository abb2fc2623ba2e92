//! ESG Sync Server
//!
//! Real-time broker that fans out entity change notifications between
//! connected clients and keeps an append-only log of every change.
//!
//! See `esg_sync::server::config` for configuration and
//! `esg_sync::server::http` for the endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use esg_sync::server::{router, Broker, EventLog, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "esg_sync=info,esg_sync_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load()?;

    match &config.config_file {
        Some(path) => tracing::info!("Config file: {}", path.display()),
        None => tracing::info!(
            "Config file: {} (not found, using defaults)",
            ServerConfig::default_config_path().display()
        ),
    }
    tracing::info!("Event log: {}", config.database_path.value.display());

    let log = Arc::new(EventLog::open(&config.database_path.value).await?);
    if let Some(seq) = log.latest_sequence().await? {
        tracing::info!("Event log holds {} event(s)", seq);
    }

    let broker = Arc::new(Broker::new(Arc::clone(&log), config.broker_options()));
    let app = router(broker);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port.value));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log.close().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
