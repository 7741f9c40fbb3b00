//! Error types for the ingestion pipeline

use thiserror::Error;

use crate::pipeline::LoadReport;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to read log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to serialize statistics: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cancelled by user")]
    Cancelled,

    /// The whole file was read but not a single line was accepted.
    #[error(
        "no records accepted from {} lines ({} malformed, {} bad timestamps, {} filtered by username); check the log format",
        .report.total_lines, .report.malformed, .report.bad_timestamp, .report.filtered_username
    )]
    NoRecords { report: LoadReport },

    #[error("ingestion worker is not running")]
    Worker,
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}
