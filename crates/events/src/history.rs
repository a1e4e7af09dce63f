//! Bounded per-job event history for diagnostics.

use std::collections::{HashMap, VecDeque};

use scribeflow_core::JobId;

use crate::event::NativeEvent;

/// Default number of events retained per job.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Per-job ring of accepted events; the oldest entry is evicted first.
#[derive(Debug)]
pub struct EventHistory {
    limit: usize,
    per_job: HashMap<JobId, VecDeque<NativeEvent>>,
}

impl EventHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            per_job: HashMap::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn record(&mut self, event: NativeEvent) {
        let entries = self.per_job.entry(event.job_id()).or_default();
        if entries.len() >= self.limit {
            entries.pop_front();
        }
        entries.push_back(event);
    }

    /// Events for `job_id`, oldest first.
    pub fn events(&self, job_id: JobId) -> Vec<NativeEvent> {
        self.per_job
            .get(&job_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last(&self, job_id: JobId) -> Option<&NativeEvent> {
        self.per_job.get(&job_id).and_then(VecDeque::back)
    }

    /// Clear one job's history, or everything when `job_id` is `None`.
    pub fn clear(&mut self, job_id: Option<JobId>) {
        match job_id {
            Some(id) => {
                self.per_job.remove(&id);
            }
            None => self.per_job.clear(),
        }
    }

    pub fn job_count(&self) -> usize {
        self.per_job.len()
    }
}

impl Default for EventHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
