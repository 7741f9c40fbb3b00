//! Job admission and progress reporting
//!
//! The tracker owns the only copy of the job state. The worker mutates it
//! through a [`JobHandle`]; pollers read snapshots from a `watch` channel and
//! never wait on the worker.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::pipeline::LoadReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Checking,
    Counting,
    Parsing,
    Finalizing,
    Indexing,
    Statistics,
}

impl Stage {
    const ORDER: [Stage; 6] = [
        Stage::Checking,
        Stage::Counting,
        Stage::Parsing,
        Stage::Finalizing,
        Stage::Indexing,
        Stage::Statistics,
    ];

    /// Relative cost of each stage, measured on multi-gigabyte files
    fn weight(self) -> f64 {
        match self {
            Stage::Checking => 0.0,
            Stage::Counting => 0.0044,
            Stage::Parsing => 386.5,
            Stage::Finalizing => 450.0,
            Stage::Indexing => 220.0,
            Stage::Statistics => 170.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Checking => "Checking freshness",
            Stage::Counting => "Counting lines",
            Stage::Parsing => "Parsing data",
            Stage::Finalizing => "Finalizing table",
            Stage::Indexing => "Building indexes",
            Stage::Statistics => "Updating statistics",
        }
    }

    /// Overall percentage for a given progress inside this stage.
    pub fn overall_progress(self, stage_progress: f64) -> f64 {
        let total: f64 = Self::ORDER.iter().map(|s| s.weight()).sum();
        let done: f64 = Self::ORDER
            .iter()
            .take_while(|s| **s != self)
            .map(|s| s.weight())
            .sum();
        let current = self.weight() * stage_progress.clamp(0.0, 100.0) / 100.0;
        ((done + current) / total * 100.0).clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: Option<Uuid>,
    pub state: JobState,
    pub is_parsing: bool,
    pub is_cancelled: bool,
    pub message: String,
    pub stage: Option<Stage>,
    pub stage_name: String,
    pub overall_progress: f64,
    pub stage_progress: f64,
    pub processed_lines: u64,
    pub total_lines: u64,
    pub accepted_records: u64,
    pub malformed_lines: u64,
    pub bad_timestamp_lines: u64,
    pub filtered_username_lines: u64,
    pub lines_per_second: f64,
    pub file_path: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    fn idle() -> Self {
        Self {
            job_id: None,
            state: JobState::Idle,
            is_parsing: false,
            is_cancelled: false,
            message: String::new(),
            stage: None,
            stage_name: String::new(),
            overall_progress: 0.0,
            stage_progress: 0.0,
            processed_lines: 0,
            total_lines: 0,
            accepted_records: 0,
            malformed_lines: 0,
            bad_timestamp_lines: 0,
            filtered_username_lines: 0,
            lines_per_second: 0.0,
            file_path: String::new(),
            started_at: None,
            finished_at: None,
        }
    }

    fn running(job_id: Uuid, file_path: &str) -> Self {
        Self {
            job_id: Some(job_id),
            state: JobState::Running,
            is_parsing: true,
            message: "Starting ingestion".to_string(),
            file_path: file_path.to_string(),
            started_at: Some(Utc::now()),
            ..Self::idle()
        }
    }
}

/// What `getStatus` returns: the raw status plus derived timings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    #[serde(flatten)]
    pub status: JobStatus,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: Option<u64>,
}

impl StatusView {
    fn at(status: JobStatus, now: DateTime<Utc>) -> Self {
        let end = status.finished_at.unwrap_or(now);
        let elapsed_ms = status
            .started_at
            .map(|started| (end - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        // Linear extrapolation of the time spent so far
        let estimated_remaining_ms = if status.state == JobState::Running
            && status.overall_progress > 0.0
        {
            let fraction = status.overall_progress / 100.0;
            Some((elapsed_ms as f64 * (1.0 - fraction) / fraction).round() as u64)
        } else {
            None
        };

        Self {
            status,
            elapsed_ms,
            estimated_remaining_ms,
        }
    }
}

pub struct JobTracker {
    running: AtomicBool,
    status: watch::Sender<JobStatus>,
    /// Token of the running job. Admission, cancellation and release all
    /// happen under this lock, so a cancel always targets the job that was
    /// running when it took the lock.
    cancel: Mutex<Option<CancellationToken>>,
}

impl JobTracker {
    pub fn new() -> Arc<Self> {
        let (status, _) = watch::channel(JobStatus::idle());
        Arc::new(Self {
            running: AtomicBool::new(false),
            status,
            cancel: Mutex::new(None),
        })
    }

    /// Admit a job unless one is running. The compare-and-set is the only
    /// mutual-exclusion point: two concurrent callers cannot both win.
    pub fn try_start(self: &Arc<Self>, file_path: &str) -> Option<JobHandle> {
        let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(path = file_path, "ingestion already running, request rejected");
            return None;
        }

        let token = CancellationToken::new();
        *slot = Some(token.clone());

        let job_id = Uuid::new_v4();
        self.status.send_replace(JobStatus::running(job_id, file_path));
        drop(slot);

        Some(JobHandle {
            tracker: Arc::clone(self),
            cancel: token,
            job_id,
            finished: false,
        })
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Request cooperative cancellation of the running job.
    pub fn cancel(&self) -> bool {
        let slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(token) => {
                token.cancel();
                self.status.send_modify(|s| {
                    s.is_cancelled = true;
                    s.message = "Cancellation requested".to_string();
                });
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status.subscribe()
    }

    /// Non-blocking snapshot of the current job.
    pub fn status(&self) -> StatusView {
        StatusView::at(self.status.borrow().clone(), Utc::now())
    }

    fn update(&self, f: impl FnOnce(&mut JobStatus)) {
        self.status.send_modify(f);
    }

    /// Publish the final state and open the gate. A cancel that has not
    /// taken the lock yet finds no job instead of overwriting the outcome.
    fn release(&self, f: impl FnOnce(&mut JobStatus)) {
        let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
        self.status.send_modify(f);
        self.running.store(false, Ordering::Release);
    }
}

/// Exclusive right to report on (and finish) the admitted job.
pub struct JobHandle {
    tracker: Arc<JobTracker>,
    cancel: CancellationToken,
    job_id: Uuid,
    finished: bool,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cooperative cancellation point.
    pub fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn enter_stage(&self, stage: Stage) {
        info!(stage = stage.label(), "entering stage");
        self.tracker.update(|s| {
            s.stage = Some(stage);
            s.stage_name = stage.label().to_string();
            s.message = format!("{}...", stage.label());
            s.stage_progress = 0.0;
            s.overall_progress = stage.overall_progress(0.0);
        });
    }

    pub fn set_stage_progress(&self, stage_progress: f64) {
        self.tracker.update(|s| {
            s.stage_progress = stage_progress.clamp(0.0, 100.0);
            if let Some(stage) = s.stage {
                s.overall_progress = stage.overall_progress(s.stage_progress);
            }
        });
    }

    pub fn set_total_lines(&self, total_lines: u64) {
        self.tracker.update(|s| s.total_lines = total_lines);
    }

    /// Parsing progress: `processed_lines / total_lines` plus the counters so far.
    pub fn report_lines(&self, report: &LoadReport, lines_per_second: f64) {
        let stage_progress = if report.total_lines > 0 {
            (report.processed_lines as f64 * 100.0 / report.total_lines as f64).min(100.0)
        } else {
            100.0
        };
        self.tracker.update(|s| {
            s.processed_lines = report.processed_lines;
            s.total_lines = report.total_lines;
            s.accepted_records = report.accepted;
            s.malformed_lines = report.malformed;
            s.bad_timestamp_lines = report.bad_timestamp;
            s.filtered_username_lines = report.filtered_username;
            s.lines_per_second = lines_per_second;
            s.stage_progress = stage_progress;
            if let Some(stage) = s.stage {
                s.overall_progress = stage.overall_progress(stage_progress);
            }
        });
    }

    pub fn complete(mut self, message: String) {
        self.finish(JobState::Completed, message);
    }

    pub fn fail(mut self, message: String) {
        self.finish(JobState::Failed, message);
    }

    fn finish(&mut self, state: JobState, message: String) {
        if self.finished {
            return;
        }
        self.finished = true;

        let cancel = &self.cancel;
        self.tracker.release(|s| {
            s.state = state;
            s.is_parsing = false;
            s.is_cancelled = cancel.is_cancelled();
            s.message = message;
            s.finished_at = Some(Utc::now());
            if state == JobState::Completed {
                s.stage_progress = 100.0;
                s.overall_progress = 100.0;
            }
        });
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if !self.finished {
            warn!(job_id = %self.job_id, "job handle dropped before completion");
            self.finish(JobState::Failed, "Job aborted unexpectedly".to_string());
        }
    }
}
