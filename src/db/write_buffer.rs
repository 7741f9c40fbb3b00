//! Batched writes into the staging table
//!
//! Accepted records are buffered and flushed as one transaction per batch.
//! Status codes and action tokens not seen before in this load are registered
//! in the reference tables inside the same transaction.

use chrono::Utc;
use sqlx::{Connection, QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::schema::STAGING_TABLE;
use crate::error::PipelineError;
use crate::parser::LogRecord;

/// 9 binds per row keeps a statement well under SQLite's variable limit
const ROWS_PER_STATEMENT: usize = 1000;

pub struct StagingWriter {
    batch_size: usize,
    buffer: Vec<LogRecord>,
    seen_statuses: HashSet<u16>,
    seen_actions: HashSet<String>,
    pending_statuses: Vec<u16>,
    pending_actions: Vec<String>,
    written: u64,
}

impl StagingWriter {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            seen_statuses: HashSet::new(),
            seen_actions: HashSet::new(),
            pending_statuses: Vec::new(),
            pending_actions: Vec::new(),
            written: 0,
        }
    }

    /// Queue a record; returns true once the batch is full.
    pub fn push(&mut self, record: LogRecord) -> bool {
        if record.status_code > 0 && self.seen_statuses.insert(record.status_code) {
            self.pending_statuses.push(record.status_code);
        }
        let action = record.action.trim();
        if !action.is_empty() && action != "-" && !self.seen_actions.contains(action) {
            self.seen_actions.insert(action.to_string());
            self.pending_actions.push(action.to_string());
        }

        self.buffer.push(record);
        self.buffer.len() >= self.batch_size
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Records committed so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Write the buffered batch in one transaction.
    ///
    /// The cancellation token is checked before commit; a cancelled batch is
    /// rolled back and nothing from it reaches the staging table.
    pub async fn flush(
        &mut self,
        conn: &mut SqliteConnection,
        cancel: &CancellationToken,
    ) -> Result<usize, PipelineError> {
        if self.buffer.is_empty() && self.pending_statuses.is_empty() && self.pending_actions.is_empty() {
            return Ok(0);
        }

        let count = self.buffer.len();
        debug!("Flushing {} records to {}", count, STAGING_TABLE);

        let mut tx = conn.begin().await?;

        for chunk in self.buffer.chunks(ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "INSERT INTO {STAGING_TABLE} (time, ip, username, url, status_code, domain, response_time_ms, response_size_bytes, action) "
            ));
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.timestamp.timestamp_millis())
                    .push_bind(record.client_ip.as_str())
                    .push_bind(record.username.as_str())
                    .push_bind(record.url.as_str())
                    .push_bind(record.status_code as i64)
                    .push_bind(record.domain.as_deref())
                    .push_bind(record.response_time_ms as i64)
                    .push_bind(record.response_size_bytes)
                    .push_bind(record.action.as_str());
            });
            builder.build().execute(&mut *tx).await?;
        }

        let now = Utc::now().timestamp_millis();
        for code in &self.pending_statuses {
            sqlx::query(
                "INSERT INTO log_statuses (status_code, created_at) VALUES (?, ?) ON CONFLICT(status_code) DO NOTHING",
            )
            .bind(*code as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        for action in &self.pending_actions {
            sqlx::query(
                "INSERT INTO log_actions (action, created_at) VALUES (?, ?) ON CONFLICT(action) DO NOTHING",
            )
            .bind(action.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        if cancel.is_cancelled() {
            tx.rollback().await?;
            self.buffer.clear();
            return Err(PipelineError::Cancelled);
        }

        tx.commit().await?;

        self.pending_statuses.clear();
        self.pending_actions.clear();
        self.buffer.clear();
        self.written += count as u64;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::create_logs_table;
    use crate::db::test_support::temp_database;
    use crate::parser::parse_line;

    fn record(status: &str, user: &str) -> LogRecord {
        parse_line(&format!(
            "1700000000.5 12 192.168.1.10 {} 2048 GET http://example.com/x {} - text/html",
            status, user
        ))
        .expect("valid line")
    }

    async fn staging_count(conn: &mut SqliteConnection) -> i64 {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM logs_staging")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        row.0
    }

    #[tokio::test]
    async fn flush_writes_batch_and_vocabulary() {
        let (_dir, db) = temp_database().await;
        let mut conn = db.acquire().await.unwrap();
        sqlx::query(&create_logs_table(STAGING_TABLE))
            .execute(&mut *conn)
            .await
            .unwrap();

        let mut writer = StagingWriter::new(3);
        assert!(!writer.push(record("TCP_MISS/200", "user_one")));
        assert!(!writer.push(record("TCP_DENIED", "user_two")));
        assert!(writer.push(record("TCP_MISS/200", "user_one")));

        let cancel = CancellationToken::new();
        let written = writer.flush(&mut conn, &cancel).await.unwrap();
        assert_eq!(written, 3);
        assert_eq!(writer.written(), 3);
        assert_eq!(writer.buffered(), 0);
        assert_eq!(staging_count(&mut conn).await, 3);
        drop(conn);

        assert_eq!(db.get_available_statuses().await.unwrap(), vec![200, 403]);
        assert_eq!(
            db.get_available_actions().await.unwrap(),
            vec!["TCP_DENIED".to_string(), "TCP_MISS".to_string()]
        );
    }

    #[tokio::test]
    async fn cancelled_flush_rolls_back() {
        let (_dir, db) = temp_database().await;
        let mut conn = db.acquire().await.unwrap();
        sqlx::query(&create_logs_table(STAGING_TABLE))
            .execute(&mut *conn)
            .await
            .unwrap();

        let mut writer = StagingWriter::new(10);
        writer.push(record("TCP_MISS/200", "user_one"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = writer.flush(&mut conn, &cancel).await;

        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(staging_count(&mut conn).await, 0);
        assert_eq!(writer.written(), 0);
    }

    #[tokio::test]
    async fn large_batches_are_split_into_statements() {
        let (_dir, db) = temp_database().await;
        let mut conn = db.acquire().await.unwrap();
        sqlx::query(&create_logs_table(STAGING_TABLE))
            .execute(&mut *conn)
            .await
            .unwrap();

        let mut writer = StagingWriter::new(2500);
        for _ in 0..2500 {
            writer.push(record("TCP_HIT/200", "user_bulk"));
        }
        let cancel = CancellationToken::new();
        assert_eq!(writer.flush(&mut conn, &cancel).await.unwrap(), 2500);
        assert_eq!(staging_count(&mut conn).await, 2500);
    }
}
