//! Decides whether a file needs to be loaded at all.
//!
//! The live table is considered current when its earliest record falls in the
//! same calendar month (UTC) as the first parsable line of the file.

use chrono::{DateTime, Datelike, Utc};
use sqlx::SqliteConnection;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::db::{live_min_time, live_row_count};
use crate::error::PipelineError;
use crate::parser::peek_timestamp;

/// Any doubt resolves to "stale"; reloading is always safe.
pub async fn is_stale(conn: &mut SqliteConnection, path: &Path) -> bool {
    match check(conn, path).await {
        Ok(stale) => stale,
        Err(e) => {
            warn!(error = %e, "freshness check failed, reloading");
            true
        }
    }
}

async fn check(conn: &mut SqliteConnection, path: &Path) -> Result<bool, PipelineError> {
    if live_row_count(conn).await? == 0 {
        info!("live table is empty");
        return Ok(true);
    }
    let Some(db_first) = live_min_time(conn).await? else {
        return Ok(true);
    };
    let Some(file_first) = first_file_timestamp(path).await? else {
        info!("no parsable line in file");
        return Ok(true);
    };

    let current = same_month(db_first, file_first);
    debug!(%db_first, %file_first, current, "compared first timestamps");
    Ok(!current)
}

fn same_month(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

async fn first_file_timestamp(path: &Path) -> Result<Option<DateTime<Utc>>, std::io::Error> {
    let mut reader = BufReader::new(File::open(path).await?);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(None);
        }
        if let Some(ts) = peek_timestamp(&String::from_utf8_lossy(&buf)) {
            return Ok(Some(ts));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    async fn insert_time(conn: &mut SqliteConnection, ts: DateTime<Utc>) {
        sqlx::query("INSERT INTO logs (time, ip, username, url, status_code, action) VALUES (?, '10.0.0.1', 'user_a', 'http://x/', 200, 'TCP_MISS')")
            .bind(ts.timestamp_millis())
            .execute(&mut *conn)
            .await
            .unwrap();
    }

    #[test]
    fn month_comparison_uses_year_and_month() {
        let a = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 59).unwrap();
        let c = Utc.with_ymd_and_hms(2023, 3, 15, 0, 0, 0).unwrap();
        assert!(same_month(a, b));
        assert!(!same_month(a, c));
    }

    #[tokio::test]
    async fn empty_table_is_stale() {
        let (_dir, db) = temp_database().await;
        let mut conn = db.acquire().await.unwrap();
        let file = file_with(&["1700000000.0 1 10.0.0.1 TCP_MISS/200 1 GET http://a/ user_a - -"]);
        assert!(is_stale(&mut conn, file.path()).await);
    }

    #[tokio::test]
    async fn same_month_is_current_and_other_month_is_stale() {
        let (_dir, db) = temp_database().await;
        let mut conn = db.acquire().await.unwrap();
        // 2023-11-14
        insert_time(&mut conn, Utc.timestamp_opt(1_700_000_000, 0).unwrap()).await;

        // First line is garbage, second is parsed; username is not validated here
        let same = file_with(&[
            "garbage",
            "2023-11-20 08:00:00.000 1 10.0.0.1 TCP_MISS/200 1 GET http://a/ nobody - -",
        ]);
        assert!(!is_stale(&mut conn, same.path()).await);

        let other = file_with(&["2023-12-01 00:00:00.000 1 10.0.0.1 TCP_MISS/200 1 GET http://a/ user_a - -"]);
        assert!(is_stale(&mut conn, other.path()).await);
    }

    #[tokio::test]
    async fn unreadable_or_unparsable_file_is_stale() {
        let (_dir, db) = temp_database().await;
        let mut conn = db.acquire().await.unwrap();
        insert_time(&mut conn, Utc.timestamp_opt(1_700_000_000, 0).unwrap()).await;

        let junk = file_with(&["nothing", "to see"]);
        assert!(is_stale(&mut conn, junk.path()).await);
        assert!(is_stale(&mut conn, Path::new("/nonexistent/access.log")).await);
    }
}
