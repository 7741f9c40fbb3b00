//! Streams a log file into the staging table.

use sqlx::SqliteConnection;
use std::path::Path;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::LoadReport;
use crate::config::IngestionConfig;
use crate::db::schema::{create_logs_table, STAGING_TABLE};
use crate::db::StagingWriter;
use crate::error::PipelineError;
use crate::jobs::JobHandle;
use crate::parser::{parse_line, Rejection};

const READ_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Number of lines, counting a final line without a trailing newline.
pub async fn count_lines(path: &Path, cancel: &CancellationToken) -> Result<u64, PipelineError> {
    let mut file = File::open(path).await?;
    let mut chunk = vec![0u8; READ_BUFFER_BYTES];
    let mut lines = 0u64;
    let mut last = b'\n';

    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        lines += chunk[..n].iter().filter(|&&b| b == b'\n').count() as u64;
        last = chunk[n - 1];
    }
    if last != b'\n' {
        lines += 1;
    }
    Ok(lines)
}

pub struct StagingLoader {
    batch_size: usize,
    progress_interval_lines: u64,
}

impl StagingLoader {
    pub fn new(settings: &IngestionConfig) -> Self {
        Self {
            batch_size: settings.batch_size,
            progress_interval_lines: settings.progress_interval_lines.max(1),
        }
    }

    pub async fn load(
        &self,
        conn: &mut SqliteConnection,
        path: &Path,
        total_lines: u64,
        job: &JobHandle,
    ) -> Result<LoadReport, PipelineError> {
        // Staging is rebuilt from the file on any failure, so skip fsyncs
        sqlx::query("PRAGMA synchronous = OFF")
            .execute(&mut *conn)
            .await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {STAGING_TABLE}"))
            .execute(&mut *conn)
            .await?;
        sqlx::query(&create_logs_table(STAGING_TABLE))
            .execute(&mut *conn)
            .await?;

        let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, File::open(path).await?);
        let mut writer = StagingWriter::new(self.batch_size);
        let mut report = LoadReport {
            total_lines,
            ..LoadReport::default()
        };
        let started = Instant::now();
        let mut buf = Vec::with_capacity(1024);

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            report.processed_lines += 1;

            // Invalid UTF-8 fails the grammar instead of aborting the read
            let line = String::from_utf8_lossy(&buf);
            match parse_line(line.trim_end_matches(['\n', '\r'])) {
                Ok(record) => {
                    report.accepted += 1;
                    if writer.push(record) {
                        job.checkpoint()?;
                        writer.flush(conn, job.cancel_token()).await?;
                        report_progress(job, &report, started);
                    }
                }
                Err(Rejection::Malformed) => report.malformed += 1,
                Err(Rejection::BadTimestamp) => report.bad_timestamp += 1,
                Err(Rejection::InvalidUsername) => report.filtered_username += 1,
            }

            if report.processed_lines % self.progress_interval_lines == 0 {
                job.checkpoint()?;
                report_progress(job, &report, started);
            }
        }

        job.checkpoint()?;
        writer.flush(conn, job.cancel_token()).await?;
        // The file may have grown since it was counted
        report.total_lines = report.total_lines.max(report.processed_lines);
        report_progress(job, &report, started);

        info!(
            total_lines = report.total_lines,
            accepted = report.accepted,
            malformed = report.malformed,
            bad_timestamp = report.bad_timestamp,
            filtered_username = report.filtered_username,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "staging load finished"
        );
        debug_assert_eq!(writer.written(), report.accepted);
        Ok(report)
    }
}

fn report_progress(job: &JobHandle, report: &LoadReport, started: Instant) {
    let elapsed = started.elapsed().as_secs_f64();
    let lines_per_second = if elapsed > 0.0 {
        report.processed_lines as f64 / elapsed
    } else {
        0.0
    };
    debug!(
        processed = report.processed_lines,
        total = report.total_lines,
        lines_per_second = lines_per_second as u64,
        "parsing progress"
    );
    job.report_lines(report, lines_per_second);
}
