//! Logstats - proxy access-log ingestion with precomputed statistics
//!
//! Loads large access logs into SQLite through a staging table, promotes
//! them atomically, and keeps dashboard snapshots up to date:
//! - Single-flight background ingestion with progress and cancellation
//! - Best-effort indexing and a daily rollup
//! - Aggregated snapshots and precalculated top lists

mod config;
mod db;
mod error;
mod jobs;
mod parser;
mod pipeline;
mod stats;
mod web;

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    // Load configuration first so the log level can come from it
    let config = config::Config::load()?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));

    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting logstats...");

    // Initialize database
    let db = db::Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!(path = %config.database.url, "Database initialized");

    let engine = stats::AggregationEngine::new(db.clone(), &config.stats);
    let pipeline = Arc::new(pipeline::Pipeline::new(
        db.clone(),
        config.ingestion.clone(),
        engine.clone(),
    ));
    let scheduler = jobs::IngestionScheduler::start(pipeline);

    // Existing data gets a fresh default snapshot before the first request
    if db.get_total_count().await.unwrap_or(0) > 0 {
        if let Err(e) = engine.refresh_all().await {
            warn!(error = %e, "Initial statistics refresh failed");
        }
    }

    if config.stats.refresh_interval_secs > 0 {
        stats::spawn_refresh_task(engine.clone(), config.stats.refresh_interval_secs);
        info!(
            interval_secs = config.stats.refresh_interval_secs,
            "Scheduled statistics refresh enabled"
        );
    }

    let state = Arc::new(web::AppState {
        scheduler,
        engine,
        db,
    });

    // Start web server (blocking)
    web::start_server(&config, state).await?;

    Ok(())
}
