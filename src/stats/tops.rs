//! Top URLs and users, live and precalculated

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::{QueryBuilder, SqliteConnection};
use tracing::debug;

use super::{bytes_to_mb, AggregatedStats, AggregationEngine, Period};
use crate::error::PipelineError;

const KIND_URLS: &str = "urls";
const KIND_USERS: &str = "users";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlStat {
    pub url: String,
    pub domain: Option<String>,
    pub count: i64,
    pub avg_response_time_ms: f64,
    pub total_bytes: i64,
    pub total_mb: f64,
    pub last_access: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStat {
    pub username: String,
    /// One of the addresses the user was seen from
    pub ip: Option<String>,
    pub count: i64,
    pub unique_ips: i64,
    pub avg_response_time_ms: f64,
    pub total_bytes: i64,
    pub total_mb: f64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

pub(super) async fn top_urls(
    conn: &mut SqliteConnection,
    period: Period,
    limit: u32,
) -> Result<Vec<UrlStat>, sqlx::Error> {
    let mut query = QueryBuilder::new(
        "SELECT url, MAX(domain), COUNT(*) AS request_count, \
                AVG(CASE WHEN response_time_ms > 0 THEN response_time_ms END), \
                CAST(TOTAL(response_size_bytes) AS INTEGER), MAX(time) \
         FROM logs WHERE url IS NOT NULL AND url != '-'",
    );
    period.push_filter(&mut query);
    query
        .push(" GROUP BY url ORDER BY request_count DESC, url ASC LIMIT ")
        .push_bind(i64::from(limit));

    let rows: Vec<(String, Option<String>, i64, Option<f64>, i64, Option<i64>)> =
        query.build_query_as().fetch_all(&mut *conn).await?;

    Ok(rows
        .into_iter()
        .map(|(url, domain, count, avg, total_bytes, last)| UrlStat {
            url,
            domain,
            count,
            avg_response_time_ms: avg.map(f64::round).unwrap_or(0.0),
            total_bytes,
            total_mb: bytes_to_mb(total_bytes),
            last_access: last.and_then(DateTime::from_timestamp_millis),
        })
        .collect())
}

pub(super) async fn top_users(
    conn: &mut SqliteConnection,
    period: Period,
    limit: u32,
) -> Result<Vec<UserStat>, sqlx::Error> {
    let mut query = QueryBuilder::new(
        "SELECT username, MIN(ip), COUNT(*) AS request_count, COUNT(DISTINCT ip), \
                AVG(CASE WHEN response_time_ms > 0 THEN response_time_ms END), \
                CAST(TOTAL(response_size_bytes) AS INTEGER), MIN(time), MAX(time) \
         FROM logs WHERE username IS NOT NULL AND username != '-'",
    );
    period.push_filter(&mut query);
    query
        .push(" GROUP BY username ORDER BY request_count DESC, username ASC LIMIT ")
        .push_bind(i64::from(limit));

    #[allow(clippy::type_complexity)]
    let rows: Vec<(String, Option<String>, i64, i64, Option<f64>, i64, Option<i64>, Option<i64>)> =
        query.build_query_as().fetch_all(&mut *conn).await?;

    Ok(rows
        .into_iter()
        .map(
            |(username, ip, count, unique_ips, avg, total_bytes, first, last)| UserStat {
                username,
                ip,
                count,
                unique_ips,
                avg_response_time_ms: avg.map(f64::round).unwrap_or(0.0),
                total_bytes,
                total_mb: bytes_to_mb(total_bytes),
                first_seen: first.and_then(DateTime::from_timestamp_millis),
                last_seen: last.and_then(DateTime::from_timestamp_millis),
            },
        )
        .collect())
}

impl AggregationEngine {
    /// Top URLs over all data, at most the configured list size.
    pub async fn top_urls(&self, limit: u32) -> Result<Vec<UrlStat>, PipelineError> {
        let limit = limit.clamp(1, self.top_urls_limit);
        if let Some(list) = self.precalculated(KIND_URLS, limit).await? {
            return Ok(list);
        }
        let mut conn = self.db.acquire().await?;
        Ok(top_urls(&mut conn, Period::all(), limit).await?)
    }

    /// Top users over all data, at most the configured list size.
    pub async fn top_users(&self, limit: u32) -> Result<Vec<UserStat>, PipelineError> {
        let limit = limit.clamp(1, self.top_users_limit);
        if let Some(list) = self.precalculated(KIND_USERS, limit).await? {
            return Ok(list);
        }
        let mut conn = self.db.acquire().await?;
        Ok(top_users(&mut conn, Period::all(), limit).await?)
    }

    /// Smallest stored list covering `limit`, truncated to it.
    async fn precalculated<T: DeserializeOwned>(
        &self,
        kind: &str,
        limit: u32,
    ) -> Result<Option<Vec<T>>, PipelineError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT data FROM precalculated_tops WHERE type = ? AND limit_count >= ? \
             ORDER BY limit_count ASC, calculated_at DESC LIMIT 1",
        )
        .bind(kind)
        .bind(i64::from(limit))
        .fetch_optional(self.db.pool())
        .await?;

        match row {
            Some((data,)) => {
                let mut list: Vec<T> = serde_json::from_str(&data)?;
                list.truncate(limit as usize);
                debug!(kind, limit, "served precalculated top list");
                Ok(Some(list))
            }
            None => Ok(None),
        }
    }

    /// Save the all-data top lists of a default snapshot.
    pub(super) async fn store_tops(&self, stats: &AggregatedStats) -> Result<(), PipelineError> {
        let now = Utc::now().timestamp_millis();
        let entries = [
            (KIND_URLS, self.top_urls_limit, serde_json::to_string(&stats.top_urls)?),
            (KIND_USERS, self.top_users_limit, serde_json::to_string(&stats.top_users)?),
        ];

        let mut tx = self.db.pool().begin().await?;
        for (kind, limit, data) in entries {
            sqlx::query(
                "INSERT INTO precalculated_tops (type, limit_count, data, calculated_at) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(type, limit_count) DO UPDATE SET data = excluded.data, calculated_at = excluded.calculated_at",
            )
            .bind(kind)
            .bind(i64::from(limit))
            .bind(data)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::config::StatsConfig;
    use crate::db::test_support::temp_database;

    #[tokio::test]
    async fn live_lists_carry_derived_metrics() {
        let (_dir, db) = temp_database().await;
        insert_rows(&db, &sample_rows()).await;
        let mut conn = db.acquire().await.unwrap();

        let urls = top_urls(&mut conn, Period::all(), 2).await.unwrap();
        assert_eq!(urls.len(), 2);
        let first = &urls[0];
        assert_eq!(first.url, "http://a.example/x");
        assert_eq!(first.domain.as_deref(), Some("a.example"));
        assert_eq!(first.count, 3);
        assert_eq!(first.avg_response_time_ms, 75.0);
        assert_eq!(first.total_bytes, 1_048_586);
        assert_eq!(first.total_mb, 1.0);
        assert_eq!(first.last_access, DateTime::from_timestamp_millis(BASE + 2 * HOUR));
        assert_eq!(urls[1].url, "http://c.example/");

        let users = top_users(&mut conn, Period::all(), 10).await.unwrap();
        let names: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["user_a", "user_b", "user_c"]);
        assert_eq!(users[0].unique_ips, 2);
        assert_eq!(users[0].ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(users[0].first_seen, DateTime::from_timestamp_millis(BASE));
        assert_eq!(users[0].last_seen, DateTime::from_timestamp_millis(BASE + 3 * HOUR + 5));
        assert_eq!(users[2].avg_response_time_ms, 0.0);
    }

    #[tokio::test]
    async fn requests_are_clamped_and_served_from_precalculated_lists() {
        let (_dir, db) = temp_database().await;
        insert_rows(&db, &sample_rows()).await;
        let engine = AggregationEngine::new(
            db.clone(),
            &StatsConfig {
                top_users_limit: 2,
                ..StatsConfig::default()
            },
        );

        // Nothing stored yet: live fallback, clamped to 2
        assert_eq!(engine.top_users(50).await.unwrap().len(), 2);

        engine.refresh_all().await.unwrap();
        let (stored,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM precalculated_tops")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(stored, 2);

        // Rows added after the refresh are not visible through the stored list
        insert_rows(
            &db,
            &[(BASE, "10.0.0.9", "user_z", "http://z.example/", 200, 1, 1)],
        )
        .await;
        let urls = engine.top_urls(1).await.unwrap();
        assert_eq!(urls.len(), 1);
        assert_eq!(urls[0].url, "http://a.example/x");
        assert!(!engine
            .top_urls(100)
            .await
            .unwrap()
            .iter()
            .any(|u| u.url == "http://z.example/"));

        // A second refresh upserts in place
        engine.refresh_all().await.unwrap();
        let (stored,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM precalculated_tops")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(stored, 2);
        assert!(engine
            .top_urls(100)
            .await
            .unwrap()
            .iter()
            .any(|u| u.url == "http://z.example/"));
    }
}
