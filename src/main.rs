//! Wattrail - power telemetry rollups, energy accounting and threshold alerts.

mod alert;
mod config;
mod db;
mod energy;
mod scheduler;
mod web;

use config::ServerConfig;
use db::Store;
use scheduler::Scheduler;
use web::Server;

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("wattrail=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting Wattrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let store = match Store::new(&cfg.db_path) {
        Ok(store) => Arc::new(store.with_sample_retention(ChronoDuration::seconds(cfg.sample_retention_secs))),
        Err(e) => {
            tracing::error!("Failed to open database {}: {}", cfg.db_path, e);
            return Err(e.into());
        }
    };
    tracing::info!("Database initialized successfully");

    let scheduler = Arc::new(Scheduler::new(store.clone(), &cfg)?);
    scheduler.start();

    let server = Server::new(cfg, store, scheduler.clone());
    let result = server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await;

    scheduler.stop().await;
    result
}
