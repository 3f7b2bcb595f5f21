//! panwatch - PAN-OS multi-firewall metrics collector.

mod aggregate;
mod buffer;
mod cache;
mod client;
mod collector;
mod config;
mod db;
mod web;

use collector::Supervisor;
use config::Config;
use db::Store;
use web::Server;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("panwatch=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PANWATCH_CONFIG").ok())
        .unwrap_or_else(|| "panwatch.yaml".to_string());
    let cfg = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!("loaded configuration from {config_path}");

    // Initialize the store
    if let Some(parent) = std::path::Path::new(&cfg.global.database_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = Arc::new(Store::open(&cfg.global.database_path, cfg.global.pool_size)?);
    tracing::info!(
        "database ready at {} (schema v{})",
        cfg.global.database_path,
        store.schema_version()?
    );

    // Retention pruning runs once at startup.
    let cutoff = Utc::now() - ChronoDuration::days(cfg.global.retention_days);
    match store.prune(cutoff) {
        Ok(0) => {}
        Ok(n) => tracing::info!(
            "pruned {n} metric records older than {} days",
            cfg.global.retention_days
        ),
        Err(e) => tracing::error!("retention pruning failed: {e}"),
    }

    // Start collection
    let supervisor = Arc::new(Supervisor::new(cfg.global.clone(), store.clone()));
    for target in cfg.firewalls.values() {
        supervisor.register(target.clone());
    }
    let enabled = cfg.enabled_targets();
    if enabled.is_empty() {
        tracing::warn!("no enabled firewalls configured");
    } else {
        for target in &enabled {
            tracing::info!(
                "monitoring {} at {} every {}s",
                target.name,
                target.host,
                target.poll_interval
            );
        }
    }
    supervisor.start_all().await;

    // Serve the read-only API until interrupted.
    let server = Server::new(cfg.global.clone(), store, supervisor.clone());
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    server.start(shutdown).await?;

    // Workers release their buffers and pool handles before exit.
    supervisor.stop_all().await;
    tracing::info!("shutdown complete");

    Ok(())
}
