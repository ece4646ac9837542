//! tagwatch - PLC tag polling and alerting service
//!
//! Polls Beckhoff PLC symbols over ADS, records value changes and raises
//! alerts for alarm tags and unreachable sites.

mod ads;
mod alerting;
mod config;
mod db;
mod scheduler;
mod web;

use ads::TcpConnector;
use config::ServerConfig;
use db::Store;
use scheduler::Scheduler;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("tagwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting tagwatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Start polling
    let connector = TcpConnector::new(cfg.poller.local_net_id);
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        Arc::new(connector),
        cfg.poller.clone(),
    ));
    scheduler.start().await?;

    // Serve until interrupted
    let server = Server::new(cfg, store, scheduler.clone());
    tokio::select! {
        result = server.start() => {
            if let Err(e) = result {
                tracing::error!("Web server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
        }
    }

    scheduler.shutdown().await;
    tracing::info!("Stopped");

    Ok(())
}
