//! Aggregated statistics snapshots
//!
//! A snapshot summarises the live table for a period, or for all data when
//! both bounds are absent. The all-data snapshot is the "default" one and is
//! unique; period snapshots accumulate as a cache keyed by their bounds.

mod tops;

pub use tops::{UrlStat, UserStat};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::StatsConfig;
use crate::db::Database;
use crate::error::PipelineError;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Optional time bounds, both inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Period {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    pub fn is_all(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    fn start_millis(&self) -> Option<i64> {
        self.start.map(|t| t.timestamp_millis())
    }

    fn end_millis(&self) -> Option<i64> {
        self.end.map(|t| t.timestamp_millis())
    }

    /// Appends ` AND time ...` for each bound that is set.
    fn push_filter(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        if let Some(start) = self.start_millis() {
            builder.push(" AND time >= ").push_bind(start);
        }
        if let Some(end) = self.end_millis() {
            builder.push(" AND time <= ").push_bind(end);
        }
    }
}

/// Requests per status class
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDistribution {
    #[serde(rename = "2xx")]
    pub success: i64,
    #[serde(rename = "3xx")]
    pub redirect: i64,
    #[serde(rename = "4xx")]
    pub client_error: i64,
    #[serde(rename = "5xx")]
    pub server_error: i64,
    pub other: i64,
}

impl StatusDistribution {
    fn add(&mut self, class: i64, count: i64) {
        match class {
            2 => self.success += count,
            3 => self.redirect += count,
            4 => self.client_error += count,
            5 => self.server_error += count,
            _ => self.other += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.success + self.redirect + self.client_error + self.server_error + self.other
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStats {
    pub id: Option<i64>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub total_requests: i64,
    pub error_requests: i64,
    pub unique_ips: i64,
    pub avg_response_time_ms: f64,
    pub total_traffic_mb: f64,
    pub status_distribution: StatusDistribution,
    pub hourly_distribution: [i64; 24],
    pub top_urls: Vec<UrlStat>,
    pub top_users: Vec<UserStat>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

impl AggregatedStats {
    pub fn period(&self) -> Period {
        Period::between(self.period_start, self.period_end)
    }
}

type SnapshotRow = (
    i64,
    Option<i64>,
    Option<i64>,
    i64,
    i64,
    i64,
    f64,
    f64,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    bool,
    i64,
);

const SNAPSHOT_COLUMNS: &str = "id, period_start, period_end, total_requests, error_requests, unique_ips, \
     avg_response_time, total_traffic_mb, status_distribution, hourly_distribution, \
     top_urls, top_users, is_default, created_at";

fn snapshot_from_row(row: SnapshotRow) -> Result<AggregatedStats, PipelineError> {
    let (
        id,
        period_start,
        period_end,
        total_requests,
        error_requests,
        unique_ips,
        avg_response_time_ms,
        total_traffic_mb,
        status_distribution,
        hourly_distribution,
        top_urls,
        top_users,
        is_default,
        created_at,
    ) = row;

    Ok(AggregatedStats {
        id: Some(id),
        period_start: period_start.and_then(DateTime::from_timestamp_millis),
        period_end: period_end.and_then(DateTime::from_timestamp_millis),
        total_requests,
        error_requests,
        unique_ips,
        avg_response_time_ms,
        total_traffic_mb,
        status_distribution: from_json_or_default(status_distribution)?,
        hourly_distribution: from_json_or_default(hourly_distribution)?,
        top_urls: from_json_or_default(top_urls)?,
        top_users: from_json_or_default(top_users)?,
        is_default,
        created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_default(),
    })
}

fn from_json_or_default<T: serde::de::DeserializeOwned + Default>(
    raw: Option<String>,
) -> Result<T, PipelineError> {
    match raw {
        Some(text) if !text.is_empty() => Ok(serde_json::from_str(&text)?),
        _ => Ok(T::default()),
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub(crate) fn bytes_to_mb(bytes: i64) -> f64 {
    round2(bytes as f64 / BYTES_PER_MB)
}

#[derive(Clone)]
pub struct AggregationEngine {
    db: Database,
    top_urls_limit: u32,
    top_users_limit: u32,
}

impl AggregationEngine {
    pub fn new(db: Database, config: &StatsConfig) -> Self {
        Self {
            db,
            top_urls_limit: config.top_urls_limit,
            top_users_limit: config.top_users_limit,
        }
    }

    /// Compute a snapshot against the live table without persisting it.
    ///
    /// All queries share one read transaction, so the histograms always add
    /// up to the total even while a load is being promoted.
    pub async fn compute(&self, period: Period) -> Result<AggregatedStats, PipelineError> {
        let mut tx = self.db.pool().begin().await?;
        let stats = self.compute_on(&mut tx, period).await?;
        tx.commit().await?;
        Ok(stats)
    }

    async fn compute_on(
        &self,
        conn: &mut SqliteConnection,
        period: Period,
    ) -> Result<AggregatedStats, PipelineError> {
        // TOTAL sums as REAL and the cast saturates, so huge sizes cannot
        // overflow the traffic sum
        let mut totals = QueryBuilder::new(
            "SELECT COUNT(*), \
                    COUNT(CASE WHEN status_code >= 400 THEN 1 END), \
                    COUNT(DISTINCT ip), \
                    AVG(CASE WHEN response_time_ms > 0 THEN response_time_ms END), \
                    CAST(TOTAL(response_size_bytes) AS INTEGER) \
             FROM logs WHERE 1 = 1",
        );
        period.push_filter(&mut totals);
        let (total_requests, error_requests, unique_ips, avg_response, total_bytes): (
            i64,
            i64,
            i64,
            Option<f64>,
            i64,
        ) = totals.build_query_as().fetch_one(&mut *conn).await?;

        let mut by_class = QueryBuilder::new(
            "SELECT COALESCE(status_code, 0) / 100 AS class, COUNT(*) FROM logs WHERE 1 = 1",
        );
        period.push_filter(&mut by_class);
        by_class.push(" GROUP BY class");
        let classes: Vec<(i64, i64)> = by_class.build_query_as().fetch_all(&mut *conn).await?;
        let mut status_distribution = StatusDistribution::default();
        for (class, count) in classes {
            status_distribution.add(class, count);
        }

        let mut by_hour = QueryBuilder::new(
            "SELECT CAST(strftime('%H', time / 1000, 'unixepoch') AS INTEGER) AS hour, COUNT(*) \
             FROM logs WHERE 1 = 1",
        );
        period.push_filter(&mut by_hour);
        by_hour.push(" GROUP BY hour");
        let hours: Vec<(i64, i64)> = by_hour.build_query_as().fetch_all(&mut *conn).await?;
        let mut hourly_distribution = [0i64; 24];
        for (hour, count) in hours {
            match usize::try_from(hour) {
                Ok(h) if h < 24 => hourly_distribution[h] += count,
                _ => warn!(hour, count, "hour of day out of range"),
            }
        }

        let top_urls = tops::top_urls(conn, period, self.top_urls_limit).await?;
        let top_users = tops::top_users(conn, period, self.top_users_limit).await?;

        Ok(AggregatedStats {
            id: None,
            period_start: period.start,
            period_end: period.end,
            total_requests,
            error_requests,
            unique_ips,
            avg_response_time_ms: avg_response.map(f64::round).unwrap_or(0.0),
            total_traffic_mb: bytes_to_mb(total_bytes),
            status_distribution,
            hourly_distribution,
            top_urls,
            top_users,
            is_default: false,
            created_at: Utc::now(),
        })
    }

    /// Persist a snapshot and return its id.
    ///
    /// Storing a default snapshot deletes the previous one in the same
    /// transaction, so at most one default row exists at any time.
    pub async fn store(&self, stats: &AggregatedStats) -> Result<i64, PipelineError> {
        let status_json = serde_json::to_string(&stats.status_distribution)?;
        let hourly_json = serde_json::to_string(&stats.hourly_distribution)?;
        let urls_json = serde_json::to_string(&stats.top_urls)?;
        let users_json = serde_json::to_string(&stats.top_users)?;

        let mut tx = self.db.pool().begin().await?;
        if stats.is_default {
            sqlx::query("DELETE FROM aggregated_stats WHERE is_default = 1")
                .execute(&mut *tx)
                .await?;
        }
        let result = sqlx::query(
            r#"
            INSERT INTO aggregated_stats
                (period_start, period_end, total_requests, error_requests, unique_ips,
                 avg_response_time, total_traffic_mb, status_distribution, hourly_distribution,
                 top_urls, top_users, is_default, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(stats.period_start.map(|t| t.timestamp_millis()))
        .bind(stats.period_end.map(|t| t.timestamp_millis()))
        .bind(stats.total_requests)
        .bind(stats.error_requests)
        .bind(stats.unique_ips)
        .bind(stats.avg_response_time_ms)
        .bind(stats.total_traffic_mb)
        .bind(status_json)
        .bind(hourly_json)
        .bind(urls_json)
        .bind(users_json)
        .bind(stats.is_default)
        .bind(stats.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(result.last_insert_rowid())
    }

    /// Recompute and replace the all-data snapshot.
    pub async fn recalculate_default(&self) -> Result<AggregatedStats, PipelineError> {
        let started = std::time::Instant::now();
        let mut stats = self.compute(Period::all()).await?;
        stats.is_default = true;
        stats.id = Some(self.store(&stats).await?);
        info!(
            total_requests = stats.total_requests,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "default statistics recalculated"
        );
        Ok(stats)
    }

    /// Compute and cache a snapshot for a period. An unbounded period is the
    /// default snapshot.
    pub async fn store_period(&self, period: Period) -> Result<AggregatedStats, PipelineError> {
        if period.is_all() {
            return self.recalculate_default().await;
        }
        let mut stats = self.compute(period).await?;
        stats.id = Some(self.store(&stats).await?);
        debug!(?period, id = stats.id, "period statistics stored");
        Ok(stats)
    }

    /// Cached snapshot for a period: exact bounds first, then the newest
    /// overlapping one. `None` means the caller should compute live.
    pub async fn find(&self, period: Period) -> Result<Option<AggregatedStats>, PipelineError> {
        let pool = self.db.pool();

        if period.is_all() {
            let row: Option<SnapshotRow> = sqlx::query_as(&format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM aggregated_stats WHERE is_default = 1 \
                 ORDER BY created_at DESC LIMIT 1"
            ))
            .fetch_optional(pool)
            .await?;
            return row.map(snapshot_from_row).transpose();
        }

        let exact: Option<SnapshotRow> = sqlx::query_as(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM aggregated_stats \
             WHERE is_default = 0 AND period_start IS ? AND period_end IS ? \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(period.start_millis())
        .bind(period.end_millis())
        .fetch_optional(pool)
        .await?;
        if let Some(row) = exact {
            return snapshot_from_row(row).map(Some);
        }

        // Missing bounds on either side are open-ended
        let overlapping: Option<SnapshotRow> = sqlx::query_as(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM aggregated_stats \
             WHERE is_default = 0 \
               AND (? IS NULL OR period_start IS NULL OR period_start <= ?) \
               AND (? IS NULL OR period_end IS NULL OR period_end >= ?) \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(period.end_millis())
        .bind(period.end_millis())
        .bind(period.start_millis())
        .bind(period.start_millis())
        .fetch_optional(pool)
        .await?;
        overlapping.map(snapshot_from_row).transpose()
    }

    /// Post-load refresh: default snapshot plus the precalculated top lists.
    pub async fn refresh_all(&self) -> Result<(), PipelineError> {
        let stats = self.recalculate_default().await?;
        self.store_tops(&stats).await
    }
}

/// Periodically recompute the default snapshot.
pub fn spawn_refresh_task(engine: AggregationEngine, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        // The first tick completes immediately; startup already has a snapshot
        interval.tick().await;

        loop {
            interval.tick().await;
            match engine.refresh_all().await {
                Ok(()) => debug!("scheduled statistics refresh done"),
                Err(e) => warn!(error = %e, "scheduled statistics refresh failed"),
            }
        }
    });
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// (time ms, ip, username, url, status, response ms, bytes)
    pub type Row<'a> = (i64, &'a str, &'a str, &'a str, i64, i64, i64);

    pub async fn insert_rows(db: &Database, rows: &[Row<'_>]) {
        for (time, ip, user, url, status, response_ms, bytes) in rows {
            sqlx::query(
                "INSERT INTO logs (time, ip, username, url, status_code, domain, response_time_ms, response_size_bytes, action) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'TCP_MISS')",
            )
            .bind(time)
            .bind(ip)
            .bind(user)
            .bind(url)
            .bind(status)
            .bind(crate::parser::extract_domain(url))
            .bind(response_ms)
            .bind(bytes)
            .execute(db.pool())
            .await
            .unwrap();
        }
    }

    // 2023-11-14 22:13:20 UTC
    pub const BASE: i64 = 1_700_000_000_000;
    pub const HOUR: i64 = 3_600_000;

    pub fn sample_rows() -> Vec<Row<'static>> {
        vec![
            (BASE, "10.0.0.1", "user_a", "http://a.example/x", 200, 100, 1_048_576),
            (BASE + 1000, "10.0.0.1", "user_a", "http://a.example/x", 304, 0, 0),
            (BASE + HOUR, "10.0.0.2", "user_b", "http://b.example/y", 404, 300, 524_288),
            (BASE + 2 * HOUR, "10.0.0.3", "user_b", "http://a.example/x", 503, 50, 10),
            (BASE + 3 * HOUR, "10.0.0.3", "user_c", "http://c.example/", 0, 0, 0),
            (BASE + 3 * HOUR + 5, "10.0.0.4", "user_a", "http://c.example/", 200, 20, 100),
        ]
    }
}
