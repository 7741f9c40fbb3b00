//! Ingestion pipeline
//!
//! One run takes a log file from disk into the live table:
//! freshness check, line count, staged load, promotion, indexes, statistics.
//! Every stage reports through the job handle and stops at the next
//! checkpoint once cancellation is requested.

mod finalizer;
mod freshness;
mod indexes;
mod loader;

pub use indexes::IndexReport;

use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

use crate::config::IngestionConfig;
use crate::db::Database;
use crate::error::PipelineError;
use crate::jobs::{JobHandle, Stage};
use crate::stats::AggregationEngine;

/// Line accounting for one load
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub total_lines: u64,
    pub processed_lines: u64,
    pub accepted: u64,
    pub malformed: u64,
    pub bad_timestamp: u64,
    pub filtered_username: u64,
}

impl LoadReport {
    pub fn rejected(&self) -> u64 {
        self.malformed + self.bad_timestamp + self.filtered_username
    }
}

#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// The live table already holds this file's month
    NotRequired,
    Loaded {
        report: LoadReport,
        indexes: IndexReport,
        /// Set when the statistics refresh failed; the load itself stands
        stats_error: Option<String>,
    },
}

impl IngestOutcome {
    pub fn summary(&self) -> String {
        match self {
            IngestOutcome::NotRequired => {
                "Data is up to date, ingestion not required".to_string()
            }
            IngestOutcome::Loaded {
                report,
                indexes,
                stats_error,
            } => {
                let mut message = format!(
                    "Loaded {} records from {} lines ({} rejected)",
                    report.accepted,
                    report.total_lines,
                    report.rejected()
                );
                if !indexes.failed.is_empty() {
                    message.push_str(&format!("; {} indexes failed", indexes.failed.len()));
                }
                if let Some(error) = stats_error {
                    message.push_str(&format!("; statistics refresh failed: {}", error));
                }
                message
            }
        }
    }
}

pub struct Pipeline {
    db: Database,
    settings: IngestionConfig,
    stats: AggregationEngine,
}

impl Pipeline {
    pub fn new(db: Database, settings: IngestionConfig, stats: AggregationEngine) -> Self {
        Self {
            db,
            settings,
            stats,
        }
    }

    pub async fn run(&self, path: &Path, job: &JobHandle) -> Result<IngestOutcome, PipelineError> {
        // The staging table is only written through this connection, which
        // also carries the relaxed durability setting for the load.
        let mut conn = self.db.acquire().await?;

        let result = self.run_stages(&mut conn, path, job).await;
        if let Err(e) = &result {
            warn!(error = %e, "ingestion stopped, discarding staging data");
            if let Err(cleanup) = finalizer::discard_staging(&mut conn).await {
                warn!(error = %cleanup, "failed to drop staging table");
            }
        }
        result
    }

    async fn run_stages(
        &self,
        conn: &mut sqlx::SqliteConnection,
        path: &Path,
        job: &JobHandle,
    ) -> Result<IngestOutcome, PipelineError> {
        job.enter_stage(Stage::Checking);
        if !freshness::is_stale(conn, path).await {
            info!(path = %path.display(), "live data already covers this file, skipping");
            return Ok(IngestOutcome::NotRequired);
        }
        job.checkpoint()?;

        job.enter_stage(Stage::Counting);
        let total_lines = loader::count_lines(path, job.cancel_token()).await?;
        job.set_total_lines(total_lines);
        info!(total_lines, "counted lines");
        job.checkpoint()?;

        job.enter_stage(Stage::Parsing);
        let report = loader::StagingLoader::new(&self.settings)
            .load(conn, path, total_lines, job)
            .await?;
        if report.accepted == 0 {
            return Err(PipelineError::NoRecords { report });
        }
        job.checkpoint()?;

        job.enter_stage(Stage::Finalizing);
        finalizer::promote(conn).await?;
        job.set_stage_progress(100.0);
        job.checkpoint()?;

        job.enter_stage(Stage::Indexing);
        let indexes = indexes::ensure_indexes(conn, |pct| job.set_stage_progress(pct)).await;
        match finalizer::register_reference_values(conn).await {
            Ok(added) => info!(added, "reference values registered"),
            Err(e) => warn!(error = %e, "failed to register reference values"),
        }
        if let Err(e) = finalizer::analyze(conn).await {
            warn!(error = %e, "ANALYZE failed");
        }
        job.checkpoint()?;

        job.enter_stage(Stage::Statistics);
        let stats_error = match self.stats.refresh_all().await {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "statistics refresh failed after load");
                Some(e.to_string())
            }
        };
        job.set_stage_progress(100.0);

        Ok(IngestOutcome::Loaded {
            report,
            indexes,
            stats_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatsConfig;
    use crate::db::schema::STAGING_TABLE;
    use crate::db::test_support::temp_database;
    use crate::db::ObjectKind;
    use crate::jobs::{JobState, JobTracker};
    use crate::stats::Period;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &[&str] = &[
        "1700000000.123 150 192.168.1.10 TCP_MISS/200 2048 GET http://example.com/a user_one - text/html",
        "1700000060.000 0 192.168.1.11 TCP_DENIED 512 GET http://blocked.example.org/ user_two - -",
        "1700000120.500 300 10.0.0.5 TCP_HIT/304 100 GET https://cdn.example.net/lib.js user_one - text/javascript",
        "this line is garbage",
        "1700000180.000 20 10.0.0.6 TCP_MISS/200 10 GET http://example.com/b nobody - -",
        "notatime 20 10.0.0.6 TCP_MISS/200 10 GET http://example.com/b user_three - -",
    ];

    fn log_file(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    fn pipeline(db: &Database, batch_size: usize) -> Pipeline {
        let settings = IngestionConfig {
            batch_size,
            progress_interval_lines: 2,
        };
        let stats = AggregationEngine::new(db.clone(), &StatsConfig::default());
        Pipeline::new(db.clone(), settings, stats)
    }

    #[tokio::test]
    async fn full_run_loads_and_reports() {
        let (_dir, db) = temp_database().await;
        let file = log_file(SAMPLE);
        let tracker = JobTracker::new();
        let job = tracker.try_start("sample.log").unwrap();

        let outcome = pipeline(&db, 2).run(file.path(), &job).await.unwrap();
        let IngestOutcome::Loaded { report, indexes, stats_error } = outcome else {
            panic!("expected a load");
        };

        assert_eq!(report.total_lines, 6);
        assert_eq!(report.processed_lines, 6);
        assert_eq!(report.accepted, 3);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.filtered_username, 1);
        assert_eq!(report.bad_timestamp, 1);
        assert!(indexes.failed.is_empty());
        assert!(stats_error.is_none());

        assert_eq!(db.get_total_count().await.unwrap(), 3);
        assert!(!db.object_exists(ObjectKind::Table, STAGING_TABLE).await.unwrap());
        assert!(db.object_exists(ObjectKind::Index, "idx_logs_time").await.unwrap());
        assert_eq!(db.get_available_statuses().await.unwrap(), vec![200, 304, 403]);

        let engine = AggregationEngine::new(db.clone(), &StatsConfig::default());
        let snapshot = engine.find(Period::all()).await.unwrap().expect("default snapshot");
        assert!(snapshot.is_default);
        assert_eq!(snapshot.total_requests, 3);
        job.complete("ok".to_string());
    }

    #[tokio::test]
    async fn same_month_reload_is_skipped() {
        let (_dir, db) = temp_database().await;
        let file = log_file(SAMPLE);
        let tracker = JobTracker::new();

        let job = tracker.try_start("sample.log").unwrap();
        pipeline(&db, 100).run(file.path(), &job).await.unwrap();
        job.complete("ok".to_string());

        let job = tracker.try_start("sample.log").unwrap();
        let outcome = pipeline(&db, 100).run(file.path(), &job).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::NotRequired));
        assert_eq!(db.get_total_count().await.unwrap(), 3);
        job.complete(outcome.summary());
    }

    #[tokio::test]
    async fn file_without_valid_lines_leaves_live_table_alone() {
        let (_dir, db) = temp_database().await;
        let tracker = JobTracker::new();

        let job = tracker.try_start("sample.log").unwrap();
        pipeline(&db, 100).run(log_file(SAMPLE).path(), &job).await.unwrap();
        job.complete("ok".to_string());

        // Parses for freshness (different month) but every user is filtered
        let bad = log_file(&[
            "1600000000.0 1 10.0.0.1 TCP_MISS/200 1 GET http://a.example/ nobody - -",
            "garbage",
        ]);
        let job = tracker.try_start("bad.log").unwrap();
        let err = pipeline(&db, 100).run(bad.path(), &job).await.unwrap_err();
        match err {
            PipelineError::NoRecords { report } => {
                assert_eq!(report.total_lines, 2);
                assert_eq!(report.filtered_username, 1);
                assert_eq!(report.malformed, 1);
            }
            other => panic!("unexpected error: {}", other),
        }
        job.fail("no records".to_string());

        assert_eq!(db.get_total_count().await.unwrap(), 3);
        assert!(!db.object_exists(ObjectKind::Table, STAGING_TABLE).await.unwrap());
    }

    #[tokio::test]
    async fn cancellation_before_promotion_keeps_previous_data() {
        let (_dir, db) = temp_database().await;
        let tracker = JobTracker::new();

        let job = tracker.try_start("sample.log").unwrap();
        pipeline(&db, 100).run(log_file(SAMPLE).path(), &job).await.unwrap();
        job.complete("ok".to_string());

        let next = log_file(&[
            "1600000000.0 1 10.0.0.1 TCP_MISS/200 1 GET http://a.example/ user_x - -",
        ]);
        let job = tracker.try_start("next.log").unwrap();
        assert!(tracker.cancel());
        let err = pipeline(&db, 100).run(next.path(), &job).await.unwrap_err();
        assert!(err.is_cancelled());
        job.fail(err.to_string());

        assert_eq!(tracker.status().status.state, JobState::Failed);
        assert!(tracker.status().status.is_cancelled);
        assert_eq!(db.get_total_count().await.unwrap(), 3);
        assert!(!db.object_exists(ObjectKind::Table, STAGING_TABLE).await.unwrap());
    }

    #[tokio::test]
    async fn cancellation_between_batches_discards_committed_staging_rows() {
        let (_dir, db) = temp_database().await;
        let tracker = JobTracker::new();

        let job = tracker.try_start("sample.log").unwrap();
        pipeline(&db, 100).run(log_file(SAMPLE).path(), &job).await.unwrap();
        job.complete("ok".to_string());

        let line = "1600000000.0 1 10.0.0.1 TCP_MISS/206 1 GET http://a.example/ user_x - -";
        let big = log_file(&vec![line; 5_000]);

        let job = tracker.try_start("big.log").unwrap();

        // Cancel as soon as the first batch is committed
        let mut updates = tracker.subscribe();
        let canceller = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                let _ = updates.wait_for(|s| s.accepted_records > 0).await;
                tracker.cancel()
            })
        };

        let settings = IngestionConfig {
            batch_size: 1,
            progress_interval_lines: 1,
        };
        let stats = AggregationEngine::new(db.clone(), &StatsConfig::default());
        let err = Pipeline::new(db.clone(), settings, stats)
            .run(big.path(), &job)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(canceller.await.unwrap());

        let status = tracker.status().status;
        assert!(status.accepted_records >= 1);
        assert!(status.accepted_records < 5_000);
        job.fail(err.to_string());

        assert!(!db.object_exists(ObjectKind::Table, STAGING_TABLE).await.unwrap());
        assert_eq!(db.get_total_count().await.unwrap(), 3);
        // Values from committed batches stay registered
        assert!(db.get_available_statuses().await.unwrap().contains(&206));

        let again = tracker.try_start("sample.log").expect("gate reopened");
        again.complete("ok".to_string());
    }

    #[test]
    fn summary_mentions_statistics_failure() {
        let outcome = IngestOutcome::Loaded {
            report: LoadReport {
                total_lines: 10,
                processed_lines: 10,
                accepted: 8,
                malformed: 2,
                ..LoadReport::default()
            },
            indexes: IndexReport::default(),
            stats_error: Some("disk full".to_string()),
        };
        let summary = outcome.summary();
        assert!(summary.contains("8 records"));
        assert!(summary.contains("2 rejected"));
        assert!(summary.contains("disk full"));
    }
}
