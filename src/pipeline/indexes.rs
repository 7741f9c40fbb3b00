//! Secondary indexes and the daily rollup for the live table

use serde::Serialize;
use sqlx::{Connection, SqliteConnection};
use tracing::{info, warn};

use crate::db::schema::{
    IndexDef, CLEAR_ROLLUP, CREATE_INDEX_ROLLUP, CREATE_ROLLUP_TABLE, LIVE_INDEXES, REFRESH_ROLLUP,
    ROLLUP_TABLE,
};
use crate::db::{object_exists, ObjectKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupAction {
    Created,
    Refreshed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
    pub failed: Vec<String>,
    pub rollup: Option<RollupAction>,
}

/// Create every missing live-table index, then build or refresh the rollup.
///
/// Failures are logged and recorded; they never stop the remaining work.
pub async fn ensure_indexes(
    conn: &mut SqliteConnection,
    mut on_progress: impl FnMut(f64),
) -> IndexReport {
    let mut report = IndexReport::default();
    let steps = (LIVE_INDEXES.len() + 1) as f64;

    for (i, def) in LIVE_INDEXES.iter().enumerate() {
        match ensure_index(conn, def).await {
            Ok(true) => {
                info!(index = def.name, "index created");
                report.created.push(def.name.to_string());
            }
            Ok(false) => report.existing.push(def.name.to_string()),
            Err(e) => {
                warn!(index = def.name, error = %e, "index creation failed, continuing");
                report.failed.push(def.name.to_string());
            }
        }
        on_progress((i + 1) as f64 * 100.0 / steps);
    }

    report.rollup = Some(match ensure_rollup(conn).await {
        Ok(action) => {
            info!(?action, "daily rollup ready");
            action
        }
        Err(e) => {
            warn!(error = %e, "daily rollup failed");
            RollupAction::Failed
        }
    });
    on_progress(100.0);

    report
}

async fn ensure_index(conn: &mut SqliteConnection, def: &IndexDef) -> Result<bool, sqlx::Error> {
    if object_exists(conn, ObjectKind::Index, def.name).await? {
        return Ok(false);
    }
    sqlx::query(def.sql).execute(&mut *conn).await?;
    Ok(true)
}

async fn ensure_rollup(conn: &mut SqliteConnection) -> Result<RollupAction, sqlx::Error> {
    if object_exists(conn, ObjectKind::Table, ROLLUP_TABLE).await? {
        let mut tx = conn.begin().await?;
        sqlx::query(CLEAR_ROLLUP).execute(&mut *tx).await?;
        sqlx::query(REFRESH_ROLLUP).execute(&mut *tx).await?;
        tx.commit().await?;
        return Ok(RollupAction::Refreshed);
    }

    sqlx::query(CREATE_ROLLUP_TABLE).execute(&mut *conn).await?;
    sqlx::query(CREATE_INDEX_ROLLUP).execute(&mut *conn).await?;
    Ok(RollupAction::Created)
}
