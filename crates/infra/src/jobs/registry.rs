//! Task registry: the single source of truth for job status and the only path
//! by which results reach the caller.
//!
//! Every `report_*` call is infallible from the caller's point of view. Reports
//! for unknown or terminal jobs are ignored, so completion, failure and
//! cancellation are each delivered at most once and never after one another.
//! Callbacks run after the registry lock is released; a panicking callback is
//! logged and swallowed.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use scribeflow_core::{
    Clock, InferenceError, JobId, ResourceId, Segment, TaskId, TranscriptionResult,
};

use super::types::{
    JobCallbacks, JobKind, JobMetadata, JobOptions, JobStatistics, JobStatus,
};

/// Error code attached to failures synthesized by [`TaskRegistry::expire_overdue`].
pub const DEADLINE_EXCEEDED: &str = "DEADLINE_EXCEEDED";

/// Registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("job already active: {0}")]
    AlreadyActive(JobId),
}

#[derive(Debug, Default)]
struct RegistryState {
    jobs: HashMap<JobId, JobMetadata>,
    callbacks: HashMap<JobId, JobCallbacks>,
    /// Most recent job registered for each task.
    tasks: HashMap<TaskId, JobId>,
}

/// In-memory job registry.
pub struct TaskRegistry {
    clock: Arc<dyn Clock>,
    default_options: JobOptions,
    state: RwLock<RegistryState>,
}

impl core::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("default_options", &self.default_options)
            .field("jobs", &self.read().jobs.len())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_defaults(clock, JobOptions::default())
    }

    /// Registry whose `register_job` uses `default_options`.
    pub fn with_defaults(clock: Arc<dyn Clock>, default_options: JobOptions) -> Self {
        Self {
            clock,
            default_options,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Register a job with the registry's default options.
    pub fn register_job(
        &self,
        job_id: JobId,
        task_id: TaskId,
        kind: JobKind,
        callbacks: JobCallbacks,
    ) -> Result<(), RegistryError> {
        self.register_job_with(job_id, task_id, kind, callbacks, self.default_options)
    }

    /// Register a job. Fails if `job_id` belongs to a job that is still active;
    /// a terminated job's id may be reused (its old record is replaced).
    pub fn register_job_with(
        &self,
        job_id: JobId,
        task_id: TaskId,
        kind: JobKind,
        callbacks: JobCallbacks,
        options: JobOptions,
    ) -> Result<(), RegistryError> {
        let now = self.clock.now();
        let mut state = self.write();
        if state.jobs.get(&job_id).is_some_and(|j| j.status.is_active()) {
            return Err(RegistryError::AlreadyActive(job_id));
        }

        state
            .jobs
            .insert(job_id, JobMetadata::new(job_id, task_id, kind, options, now));
        state.callbacks.insert(job_id, callbacks);
        state.tasks.insert(task_id, job_id);
        debug!(job_id = %job_id, task_id = %task_id, kind = %kind, "job registered");
        Ok(())
    }

    /// Mark a pending job as waiting for its engine resource.
    pub fn mark_initializing(&self, job_id: JobId) -> bool {
        let mut state = self.write();
        state
            .jobs
            .get_mut(&job_id)
            .is_some_and(|job| job.status == JobStatus::Pending && job.transition(JobStatus::Initializing))
    }

    /// Record the pooled resource serving the job.
    pub fn attach_context(&self, job_id: JobId, resource_id: ResourceId) -> bool {
        let mut state = self.write();
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status.is_active() => {
                job.context_id = Some(resource_id);
                true
            }
            _ => false,
        }
    }

    /// Bump the retry counter; returns the new count.
    pub fn increment_retry(&self, job_id: JobId) -> Option<u32> {
        let mut state = self.write();
        let job = state.jobs.get_mut(&job_id)?;
        job.retry_count += 1;
        Some(job.retry_count)
    }

    /// Report progress. Ignored for unknown or terminal jobs.
    pub fn report_progress(&self, job_id: JobId, progress: f64) -> bool {
        let (effective, callback) = {
            let mut state = self.write();
            let Some(job) = state.jobs.get_mut(&job_id) else {
                debug!(job_id = %job_id, "progress for unknown job ignored");
                return false;
            };
            let Some(effective) = job.apply_progress(progress) else {
                debug!(job_id = %job_id, status = %job.status, progress, "progress ignored");
                return false;
            };
            let callback = state
                .callbacks
                .get(&job_id)
                .and_then(|c| c.on_progress.clone());
            (effective, callback)
        };

        if let Some(cb) = callback {
            invoke(job_id, "on_progress", || cb(job_id, effective));
        }
        true
    }

    /// Deliver a partial segment. Does not change status; ignored once the job
    /// is terminal.
    pub fn report_segment(&self, job_id: JobId, segment: &Segment) -> bool {
        let callback = {
            let state = self.read();
            match state.jobs.get(&job_id) {
                Some(job) if !job.is_terminal() => {}
                Some(job) => {
                    debug!(job_id = %job_id, status = %job.status, "segment for finished job ignored");
                    return false;
                }
                None => {
                    debug!(job_id = %job_id, "segment for unknown job ignored");
                    return false;
                }
            }
            state
                .callbacks
                .get(&job_id)
                .and_then(|c| c.on_segment.clone())
        };

        if let Some(cb) = callback {
            invoke(job_id, "on_segment", || cb(job_id, segment));
        }
        true
    }

    /// Complete the job. Idempotent: only the first terminal report wins and
    /// `on_complete` fires at most once.
    pub fn report_completion(&self, job_id: JobId, result: &TranscriptionResult) -> bool {
        let now = self.clock.now();
        let callback = {
            let mut state = self.write();
            let Some(job) = state.jobs.get_mut(&job_id) else {
                debug!(job_id = %job_id, "completion for unknown job ignored");
                return false;
            };
            if !job.mark_completed(now) {
                debug!(job_id = %job_id, status = %job.status, "completion for finished job ignored");
                return false;
            }
            state
                .callbacks
                .get(&job_id)
                .and_then(|c| c.on_complete.clone())
        };

        info!(job_id = %job_id, "job completed");
        if let Some(cb) = callback {
            invoke(job_id, "on_complete", || cb(job_id, result));
        }
        true
    }

    /// Fail the job. Same idempotence as [`Self::report_completion`].
    pub fn report_error(&self, job_id: JobId, err: &InferenceError) -> bool {
        let now = self.clock.now();
        let callback = {
            let mut state = self.write();
            let Some(job) = state.jobs.get_mut(&job_id) else {
                debug!(job_id = %job_id, "error for unknown job ignored");
                return false;
            };
            if !job.mark_failed(now) {
                debug!(job_id = %job_id, status = %job.status, "error for finished job ignored");
                return false;
            }
            state
                .callbacks
                .get(&job_id)
                .and_then(|c| c.on_error.clone())
        };

        warn!(job_id = %job_id, error = %err, code = ?err.code, "job failed");
        if let Some(cb) = callback {
            invoke(job_id, "on_error", || cb(job_id, err));
        }
        true
    }

    /// Cancel the job. Cancellation is visible through status only; later
    /// reports for the job are ignored.
    pub fn cancel_job(&self, job_id: JobId) -> bool {
        let now = self.clock.now();
        let mut state = self.write();
        let cancelled = state
            .jobs
            .get_mut(&job_id)
            .is_some_and(|job| job.mark_cancelled(now));
        if cancelled {
            info!(job_id = %job_id, "job cancelled");
        }
        cancelled
    }

    /// Release the job's callbacks. Metadata is kept for statistics.
    pub fn unregister_job(&self, job_id: JobId) -> bool {
        self.write().callbacks.remove(&job_id).is_some()
    }

    /// Fail every active job whose deadline has passed. Returns the expired ids.
    pub fn expire_overdue(&self) -> Vec<JobId> {
        let now = self.clock.now();
        let overdue: Vec<JobId> = self
            .read()
            .jobs
            .values()
            .filter(|job| job.is_overdue(now))
            .map(|job| job.job_id)
            .collect();

        overdue
            .into_iter()
            .filter(|&job_id| {
                let err = InferenceError::with_code(DEADLINE_EXCEEDED, "job deadline exceeded");
                self.report_error(job_id, &err)
            })
            .collect()
    }

    pub fn get_job(&self, job_id: JobId) -> Option<JobMetadata> {
        self.read().jobs.get(&job_id).cloned()
    }

    /// Latest job registered for `task_id`.
    pub fn get_job_by_task(&self, task_id: TaskId) -> Option<JobMetadata> {
        let state = self.read();
        state
            .tasks
            .get(&task_id)
            .and_then(|job_id| state.jobs.get(job_id))
            .cloned()
    }

    pub fn active_jobs(&self) -> Vec<JobMetadata> {
        let mut jobs: Vec<_> = self
            .read()
            .jobs
            .values()
            .filter(|j| j.status.is_active())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.start_time);
        jobs
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<JobMetadata> {
        let mut jobs: Vec<_> = self
            .read()
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.start_time);
        jobs
    }

    /// Drop terminal jobs that ended more than `older_than` ago. Returns the
    /// number removed.
    pub fn cleanup_finished(&self, older_than: Duration) -> usize {
        let age = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = self.clock.now().checked_sub_signed(age) else {
            return 0;
        };
        let mut state = self.write();
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.is_terminal() && j.end_time.is_some_and(|end| end < cutoff))
            .map(|j| j.job_id)
            .collect();

        for job_id in &expired {
            if let Some(job) = state.jobs.remove(job_id) {
                if state.tasks.get(&job.task_id) == Some(job_id) {
                    state.tasks.remove(&job.task_id);
                }
            }
            state.callbacks.remove(job_id);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "finished jobs cleaned up");
        }
        expired.len()
    }

    /// Forget every job.
    pub fn clear(&self) {
        let mut state = self.write();
        state.jobs.clear();
        state.callbacks.clear();
        state.tasks.clear();
    }

    pub fn statistics(&self) -> JobStatistics {
        let state = self.read();
        let mut stats = JobStatistics {
            total: state.jobs.len(),
            ..JobStatistics::default()
        };

        let mut processing_ms = 0.0;
        let mut retries: u64 = 0;
        for job in state.jobs.values() {
            retries += u64::from(job.retry_count);
            match job.status {
                JobStatus::Completed => {
                    stats.completed += 1;
                    processing_ms += job
                        .processing_time()
                        .map(|d| d.as_secs_f64() * 1000.0)
                        .unwrap_or_default();
                }
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                _ => stats.active += 1,
            }
        }

        if stats.completed > 0 {
            stats.average_processing_time_ms = processing_ms / stats.completed as f64;
        }
        if stats.total > 0 {
            stats.average_retries = retries as f64 / stats.total as f64;
        }
        let finished = stats.completed + stats.failed + stats.cancelled;
        if finished > 0 {
            stats.success_rate = stats.completed as f64 / finished as f64;
        }
        stats
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn invoke(job_id: JobId, callback: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(job_id = %job_id, callback, "job callback panicked");
    }
}
