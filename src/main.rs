//! Obsera Monitor - multi-tenant endpoint health monitoring.
//!
//! Probes tenant endpoints, opens and resolves outages, rolls up uptime,
//! serves status pages and joins traces with logs.

mod config;
mod db;
mod outage;
mod probe;
mod registry;
mod scheduler;
mod status_page;
mod telemetry;
mod web;

use config::ServerConfig;
use db::Store;
use outage::{DebounceConfig, OutageDetector};
use registry::Registry;
use scheduler::Scheduler;
use status_page::{StatusPageProjector, UnlockSessions};
use telemetry::{ClickHouseClient, Correlator};
use web::{AppState, Server};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("obsera_monitor=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Obsera Monitor on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let detector = Arc::new(OutageDetector::new(
        store.clone(),
        DebounceConfig {
            down_threshold: cfg.down_threshold,
            degraded_threshold: cfg.degraded_threshold,
        },
    ));

    // Start scheduler
    let client = probe::build_client()?;
    let scheduler = Arc::new(Scheduler::new(store.clone(), detector, client, &cfg));
    scheduler.start().await?;

    let registry = Arc::new(Registry::new(store.clone(), cfg.immutable_retention));
    let aggregator = scheduler.aggregator();

    let status_pages = Arc::new(StatusPageProjector::new(
        store.clone(),
        aggregator.clone(),
        UnlockSessions::new(cfg.unlock_token_ttl()),
    ));
    status_pages.start_sweeper();

    let clickhouse = Arc::new(ClickHouseClient::new(
        &cfg.clickhouse_url,
        &cfg.clickhouse_user,
        &cfg.clickhouse_password,
        cfg.backend_timeout(),
    )?);
    let correlator = Arc::new(Correlator::new(clickhouse.clone(), clickhouse));

    // Start web server
    let server = Server::new(AppState {
        config: cfg,
        store,
        registry,
        scheduler,
        aggregator,
        status_pages,
        correlator,
    });
    server.start().await?;

    Ok(())
}
