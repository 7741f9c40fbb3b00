//! Promotion of the staging table and post-load bookkeeping

use chrono::Utc;
use sqlx::{Connection, SqliteConnection};
use tracing::{debug, info};

use crate::db::schema::{BACKUP_TABLE, LIVE_TABLE, STAGING_TABLE};
use crate::db::{object_exists, ObjectKind};
use crate::error::PipelineError;

/// Swap staging in as the live table, keeping the previous one as backup.
///
/// All renames commit together: readers see either the old live table or the
/// new one, and a failure leaves the old one in place.
pub async fn promote(conn: &mut SqliteConnection) -> Result<(), PipelineError> {
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&mut *conn)
        .await?;
    // Flush the load out of the WAL before the table becomes visible
    sqlx::query("PRAGMA wal_checkpoint(PASSIVE)")
        .execute(&mut *conn)
        .await?;

    let mut tx = conn.begin().await?;

    sqlx::query(&format!("DROP TABLE IF EXISTS {BACKUP_TABLE}"))
        .execute(&mut *tx)
        .await?;

    if object_exists(&mut tx, ObjectKind::Table, LIVE_TABLE).await? {
        sqlx::query(&format!("ALTER TABLE {LIVE_TABLE} RENAME TO {BACKUP_TABLE}"))
            .execute(&mut *tx)
            .await?;

        // Index names are global; free them for the new live table
        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL",
        )
        .bind(BACKUP_TABLE)
        .fetch_all(&mut *tx)
        .await?;
        for (name,) in names {
            debug!(index = %name, "dropping backup index");
            sqlx::query(&format!("DROP INDEX IF EXISTS \"{}\"", name.replace('"', "\"\"")))
                .execute(&mut *tx)
                .await?;
        }
    }

    sqlx::query(&format!("ALTER TABLE {STAGING_TABLE} RENAME TO {LIVE_TABLE}"))
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    info!("staging table promoted to live");
    Ok(())
}

/// Best-effort cleanup after a failed or cancelled run.
pub async fn discard_staging(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!("DROP TABLE IF EXISTS {STAGING_TABLE}"))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Register every distinct status and action of the live table.
///
/// Returns the number of newly added values.
pub async fn register_reference_values(conn: &mut SqliteConnection) -> Result<u64, sqlx::Error> {
    let now = Utc::now().timestamp_millis();

    let statuses = sqlx::query(&format!(
        "INSERT OR IGNORE INTO log_statuses (status_code, created_at) \
         SELECT DISTINCT status_code, ? FROM {LIVE_TABLE} WHERE status_code > 0"
    ))
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let actions = sqlx::query(&format!(
        "INSERT OR IGNORE INTO log_actions (action, created_at) \
         SELECT DISTINCT action, ? FROM {LIVE_TABLE} \
         WHERE action IS NOT NULL AND trim(action) != '' AND action != '-'"
    ))
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(statuses.rows_affected() + actions.rows_affected())
}

pub async fn analyze(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("ANALYZE {LIVE_TABLE}"))
        .execute(&mut *conn)
        .await?;
    Ok(())
}
