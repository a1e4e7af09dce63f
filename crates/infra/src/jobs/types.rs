//! Core job types and the status state machine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scribeflow_core::{InferenceError, JobId, ResourceId, Segment, TaskId, TranscriptionResult};

/// Retry ceiling applied when a job is registered without options.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What the job asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Transcribe an audio file.
    File,
    /// Transcribe an in-memory sample buffer.
    Buffer,
    /// Chunked real-time transcription.
    Realtime,
    /// Spoken-language detection only.
    LanguageDetection,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::File => "file",
            JobKind::Buffer => "buffer",
            JobKind::Realtime => "realtime",
            JobKind::LanguageDetection => "language_detection",
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job execution status.
///
/// `Pending → [Initializing] → Processing → {Completed | Failed | Cancelled}`.
/// Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Registered, not yet dispatched
    Pending,
    /// Waiting for a pooled resource
    Initializing,
    /// Engine is producing output
    Processing,
    /// Reserved; no operation enters this state yet
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Initializing | Processing) => true,
            (Initializing, Processing) => true,
            (Processing, Paused) | (Paused, Processing) => true,
            (from, Completed | Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Initializing => "initializing",
            JobStatus::Processing => "processing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job registration options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    pub max_retries: u32,
    /// Fail the job if it has not terminated this long after registration.
    pub deadline: Option<Duration>,
    /// Attempts already made for the task; set when re-dispatching under a
    /// fresh job id.
    pub retry_count: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            deadline: None,
            retry_count: 0,
        }
    }
}

impl JobOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Status and bookkeeping for one job. Owned by the registry; callers get
/// snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Percentage, 0..=100.
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Pooled resource serving this job.
    pub context_id: Option<ResourceId>,
    pub deadline: Option<DateTime<Utc>>,
}

impl JobMetadata {
    pub fn new(
        job_id: JobId,
        task_id: TaskId,
        kind: JobKind,
        options: JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            task_id,
            kind,
            status: JobStatus::Pending,
            progress: 0,
            start_time: now,
            end_time: None,
            retry_count: options.retry_count,
            max_retries: options.max_retries,
            context_id: None,
            deadline: options
                .deadline
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| now + d),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Processing time of a finished job.
    pub fn processing_time(&self) -> Option<Duration> {
        self.end_time
            .map(|end| scribeflow_core::clock::elapsed(self.start_time, end))
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.deadline.is_some_and(|d| now >= d)
    }

    /// Move to `next` if legal. Returns whether the status changed.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Apply a progress report; returns the effective progress, or `None` if
    /// the report is ignored (terminal job or non-finite value).
    ///
    /// Progress never decreases; a lower report keeps the current value.
    pub fn apply_progress(&mut self, reported: f64) -> Option<u8> {
        if self.is_terminal() || !reported.is_finite() {
            return None;
        }
        if matches!(self.status, JobStatus::Pending | JobStatus::Initializing) {
            self.transition(JobStatus::Processing);
        }
        let clamped = reported.clamp(0.0, 100.0).round() as u8;
        self.progress = self.progress.max(clamped);
        Some(self.progress)
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> bool {
        if !self.transition(JobStatus::Completed) {
            return false;
        }
        self.progress = 100;
        self.end_time = Some(now);
        true
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>) -> bool {
        if !self.transition(JobStatus::Failed) {
            return false;
        }
        self.end_time = Some(now);
        true
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> bool {
        if !self.transition(JobStatus::Cancelled) {
            return false;
        }
        self.end_time = Some(now);
        true
    }
}

pub type ProgressCallback = Arc<dyn Fn(JobId, u8) + Send + Sync>;
pub type SegmentCallback = Arc<dyn Fn(JobId, &Segment) + Send + Sync>;
pub type CompleteCallback = Arc<dyn Fn(JobId, &TranscriptionResult) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(JobId, &InferenceError) + Send + Sync>;

/// Caller callbacks attached at registration.
#[derive(Clone, Default)]
pub struct JobCallbacks {
    pub on_progress: Option<ProgressCallback>,
    pub on_segment: Option<SegmentCallback>,
    pub on_complete: Option<CompleteCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl core::fmt::Debug for JobCallbacks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_segment", &self.on_segment.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl JobCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl Fn(JobId, u8) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn on_segment(mut self, f: impl Fn(JobId, &Segment) + Send + Sync + 'static) -> Self {
        self.on_segment = Some(Arc::new(f));
        self
    }

    pub fn on_complete(
        mut self,
        f: impl Fn(JobId, &TranscriptionResult) + Send + Sync + 'static,
    ) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(JobId, &InferenceError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

/// Aggregate job statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStatistics {
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Mean processing time over completed jobs, in milliseconds.
    pub average_processing_time_ms: f64,
    pub average_retries: f64,
    /// `completed / (completed + failed + cancelled)`; 0 when nothing finished.
    pub success_rate: f64,
}
