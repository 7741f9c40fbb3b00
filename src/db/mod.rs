//! Database module

pub mod schema;
mod write_buffer;

pub use write_buffer::StagingWriter;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::time::Duration;

use crate::config::DatabaseConfig;

/// Kind of schema object looked up in `sqlite_master`
#[derive(Debug, Clone, Copy)]
pub enum ObjectKind {
    Table,
    Index,
}

impl ObjectKind {
    fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Table => "table",
            ObjectKind::Index => "index",
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        // Per-connection pragmas go through the connect options so every
        // pooled connection gets them, not just the one running migrations.
        let options = SqliteConnectOptions::new()
            .filename(&config.url)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .pragma("cache_size", format!("-{}", config.cache_size_mb as u64 * 1024));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Check out one connection for a unit of work that needs session state.
    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>, sqlx::Error> {
        self.pool.acquire().await
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(&schema::create_logs_table(schema::LIVE_TABLE))
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_STATUSES_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_ACTIONS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_AGGREGATED_STATS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_STATS_PERIOD)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_STATS_DEFAULT)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_PRECALCULATED_TOPS_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_total_count(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM logs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Status codes seen in any load, ascending
    pub async fn get_available_statuses(&self) -> Result<Vec<i64>, sqlx::Error> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT status_code FROM log_statuses ORDER BY status_code")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(code,)| code).collect())
    }

    /// Proxy action tokens seen in any load, alphabetical
    pub async fn get_available_actions(&self) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT action FROM log_actions ORDER BY action")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(action,)| action).collect())
    }

    pub async fn object_exists(&self, kind: ObjectKind, name: &str) -> Result<bool, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        object_exists(&mut conn, kind, name).await
    }
}

/// `sqlite_master` lookup usable on a checked-out connection.
pub async fn object_exists(
    conn: &mut SqliteConnection,
    kind: ObjectKind,
    name: &str,
) -> Result<bool, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = ? AND name = ?")
        .bind(kind.as_str())
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.0 > 0)
}

/// Earliest timestamp in the live table, `None` when it is empty.
pub async fn live_min_time(
    conn: &mut SqliteConnection,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let row: (Option<i64>,) = sqlx::query_as("SELECT MIN(time) FROM logs")
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.0.and_then(DateTime::from_timestamp_millis))
}

pub async fn live_row_count(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM logs")
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.0)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// A migrated database in a fresh temporary directory.
    pub async fn temp_database() -> (TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = DatabaseConfig {
            url: dir.path().join("test.db").to_string_lossy().into_owned(),
            max_connections: 4,
            ..DatabaseConfig::default()
        };
        let db = Database::new(&config).await.expect("open database");
        db.run_migrations().await.expect("migrations");
        (dir, db)
    }
}
