//! Background ingestion scheduling
//!
//! A single worker task receives admitted jobs over a channel and runs them
//! one at a time. Admission happens in the caller's task through the
//! tracker's gate, so a rejected request never reaches the worker.

mod status;

pub use status::{JobHandle, JobState, JobTracker, Stage, StatusView};

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, Instrument};

use crate::error::PipelineError;
use crate::pipeline::Pipeline;

struct QueuedJob {
    path: PathBuf,
    handle: JobHandle,
}

#[derive(Clone)]
pub struct IngestionScheduler {
    tracker: Arc<JobTracker>,
    tx: mpsc::Sender<QueuedJob>,
}

impl IngestionScheduler {
    /// Spawn the worker and return the handle used to feed it.
    pub fn start(pipeline: Arc<Pipeline>) -> Self {
        // The gate admits one job at a time, so one slot is enough
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(run_worker(pipeline, rx));

        Self {
            tracker: JobTracker::new(),
            tx,
        }
    }

    /// Returns false when a job is already running.
    pub fn start_ingestion(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        let Some(handle) = self.tracker.try_start(&path.to_string_lossy()) else {
            return false;
        };

        match self.tx.try_send(QueuedJob { path, handle }) {
            Ok(()) => true,
            Err(e) => {
                let job = e.into_inner();
                error!(path = %job.path.display(), "ingestion worker unavailable");
                job.handle.fail(PipelineError::Worker.to_string());
                false
            }
        }
    }

    pub fn cancel(&self) -> bool {
        self.tracker.cancel()
    }

    pub fn status(&self) -> StatusView {
        self.tracker.status()
    }
}

async fn run_worker(pipeline: Arc<Pipeline>, mut rx: mpsc::Receiver<QueuedJob>) {
    info!("ingestion worker started");
    while let Some(QueuedJob { path, handle }) = rx.recv().await {
        let span = info_span!("ingestion", job_id = %handle.job_id(), path = %path.display());
        async {
            info!("ingestion started");
            match pipeline.run(&path, &handle).await {
                Ok(outcome) => {
                    let summary = outcome.summary();
                    info!("{}", summary);
                    handle.complete(summary);
                }
                Err(e) if e.is_cancelled() => {
                    info!("ingestion cancelled");
                    handle.fail(e.to_string());
                }
                Err(e) => {
                    error!(error = %e, "ingestion failed");
                    handle.fail(e.to_string());
                }
            }
        }
        .instrument(span)
        .await;
    }
    info!("ingestion worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IngestionConfig, StatsConfig};
    use crate::db::test_support::temp_database;
    use crate::stats::AggregationEngine;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    async fn wait_until_idle(scheduler: &IngestionScheduler) -> StatusView {
        for _ in 0..500 {
            let view = scheduler.status();
            if !view.status.is_parsing {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not finish in time");
    }

    #[tokio::test]
    async fn runs_job_to_completion_and_reopens_gate() {
        let (_dir, db) = temp_database().await;
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "1700000000.123 45 10.0.0.5 TCP_MISS/200 512 GET http://example.com/a user_a_b - - text/html"
        )
        .unwrap();
        writeln!(
            file,
            "1700000000.123 45 10.0.0.5 TCP_MISS/200 512 GET http://example.com/a - - text/html"
        )
        .unwrap();

        let engine = AggregationEngine::new(db.clone(), &StatsConfig::default());
        let pipeline = Arc::new(Pipeline::new(db.clone(), IngestionConfig::default(), engine));
        let scheduler = IngestionScheduler::start(pipeline);

        assert!(scheduler.start_ingestion(file.path()));
        let view = wait_until_idle(&scheduler).await;
        assert_eq!(view.status.state, JobState::Completed, "{}", view.status.message);
        assert_eq!(view.status.accepted_records, 1);
        assert_eq!(view.status.filtered_username_lines, 1);
        assert_eq!(db.get_total_count().await.unwrap(), 1);

        // Unchanged file: second run is admitted and skips the load
        assert!(scheduler.start_ingestion(file.path()));
        let view = wait_until_idle(&scheduler).await;
        assert_eq!(view.status.state, JobState::Completed);
        assert!(view.status.message.contains("not required"));
    }

    #[tokio::test]
    async fn missing_file_fails_the_job() {
        let (_dir, db) = temp_database().await;
        let engine = AggregationEngine::new(db.clone(), &StatsConfig::default());
        let pipeline = Arc::new(Pipeline::new(db.clone(), IngestionConfig::default(), engine));
        let scheduler = IngestionScheduler::start(pipeline);

        assert!(scheduler.start_ingestion("/nonexistent/access.log"));
        let view = wait_until_idle(&scheduler).await;
        assert_eq!(view.status.state, JobState::Failed);
        assert!(view.status.message.contains("failed to read log file"));
        assert!(!scheduler.cancel());
    }
}
