//! HTTP routes for ingestion control and statistics

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use super::AppState;
use crate::jobs::StatusView;
use crate::stats::{AggregatedStats, Period, UrlStat, UserStat};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn internal(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Debug, Deserialize)]
pub struct IngestionRequest {
    pub file_path: String,
}

#[derive(Debug, Serialize)]
pub struct IngestionResponse {
    pub accepted: bool,
}

/// API: start an ingestion job; `accepted` is false while one is running
pub async fn start_ingestion(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestionRequest>,
) -> ApiResult<IngestionResponse> {
    if request.file_path.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "file_path is required".to_string()));
    }
    let accepted = state.scheduler.start_ingestion(request.file_path.trim());
    Ok(Json(IngestionResponse { accepted }))
}

pub async fn ingestion_status(State(state): State<Arc<AppState>>) -> Json<StatusView> {
    Json(state.scheduler.status())
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

pub async fn cancel_ingestion(State(state): State<Arc<AppState>>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.scheduler.cancel(),
    })
}

#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsSource {
    Snapshot,
    Live,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub source: StatsSource,
    pub stats: AggregatedStats,
}

/// API: cached snapshot for the period, computed live when none is stored
pub async fn aggregated_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PeriodQuery>,
) -> ApiResult<StatsResponse> {
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return Err((StatusCode::BAD_REQUEST, "from must not be after to".to_string()));
        }
    }
    let period = Period::between(query.from, query.to);

    // A broken cache must not hide the data itself
    let cached = match state.engine.find(period).await {
        Ok(found) => found,
        Err(e) => {
            warn!(error = %e, "snapshot lookup failed, computing live");
            None
        }
    };
    if let Some(stats) = cached {
        return Ok(Json(StatsResponse {
            source: StatsSource::Snapshot,
            stats,
        }));
    }

    let stats = state.engine.compute(period).await.map_err(internal)?;
    Ok(Json(StatsResponse {
        source: StatsSource::Live,
        stats,
    }))
}

pub async fn recalculate_default(State(state): State<Arc<AppState>>) -> ApiResult<AggregatedStats> {
    state
        .engine
        .recalculate_default()
        .await
        .map(Json)
        .map_err(internal)
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u32>,
}

pub async fn top_urls(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<UrlStat>> {
    let limit = query.limit.unwrap_or(u32::MAX);
    state.engine.top_urls(limit).await.map(Json).map_err(internal)
}

pub async fn top_users(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<UserStat>> {
    let limit = query.limit.unwrap_or(u32::MAX);
    state.engine.top_users(limit).await.map(Json).map_err(internal)
}

pub async fn available_statuses(State(state): State<Arc<AppState>>) -> ApiResult<Vec<i64>> {
    state.db.get_available_statuses().await.map(Json).map_err(internal)
}

pub async fn available_actions(State(state): State<Arc<AppState>>) -> ApiResult<Vec<String>> {
    state.db.get_available_actions().await.map(Json).map_err(internal)
}
