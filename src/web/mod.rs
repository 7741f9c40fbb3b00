//! Web server module

mod routes;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::jobs::IngestionScheduler;
use crate::stats::AggregationEngine;

pub struct AppState {
    pub scheduler: IngestionScheduler,
    pub engine: AggregationEngine,
    pub db: Database,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/ingestion", post(routes::start_ingestion))
        .route("/api/ingestion/status", get(routes::ingestion_status))
        .route("/api/ingestion/cancel", post(routes::cancel_ingestion))
        .route("/api/stats", get(routes::aggregated_stats))
        .route(
            "/api/stats/recalculate-default",
            post(routes::recalculate_default),
        )
        .route("/api/top-urls", get(routes::top_urls))
        .route("/api/top-users", get(routes::top_users))
        .route("/api/statuses", get(routes::available_statuses))
        .route("/api/actions", get(routes::available_actions))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(config: &Config, state: Arc<AppState>) -> Result<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Web server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
