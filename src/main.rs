//! uptrail - Synthetic Uptime Monitoring
//!
//! Probes registered HTTP/HTTPS endpoints and ping hosts, records every
//! outcome in SQLite, and serves the history over a JSON API.

mod config;
mod db;
mod probe;
mod scheduler;
mod web;

#[cfg(test)]
mod test_support;

use config::ServerConfig;
use db::Store;
use probe::{Prober, ProtocolKind};
use scheduler::{Monitor, Scheduler};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("uptrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting uptrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Add sample target if none exist
    if store.get_targets()?.is_empty() {
        tracing::info!("Adding sample target: example.com");
        let mut target = db::Target {
            name: "Example".to_string(),
            address: "example.com".to_string(),
            kind: ProtocolKind::Https,
            ..Default::default()
        };
        store.add_target(&mut target)?;
    }

    let prober = Prober::new(cfg.probe_settings())?;
    let monitor = Arc::new(Monitor::new(prober, store.clone()).with_jitter(cfg.probe_jitter));
    let scheduler = Arc::new(Scheduler::new(store.clone(), monitor, cfg.run_interval));

    // Start scheduler
    scheduler.start();

    // Start web server
    let server = Server::new(cfg, store, scheduler);
    server.start().await?;

    Ok(())
}
