//! Failure-isolated fan-out of accepted events to ad hoc subscribers.
//!
//! - Job-scoped subscribers run before global ones
//! - Handlers run outside the registry lock, so a handler may subscribe or
//!   unsubscribe without deadlocking
//! - A panicking handler is logged and skipped; the remaining handlers still run

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::error;

use scribeflow_core::JobId;

use crate::event::NativeEvent;

/// Subscriber callback.
pub type EventHandler = Arc<dyn Fn(&NativeEvent) + Send + Sync>;

type Entry = (u64, EventHandler);

#[derive(Default)]
struct Registry {
    global: Vec<Entry>,
    per_job: HashMap<JobId, Vec<Entry>>,
}

/// Set of job-scoped and global event subscribers.
#[derive(Default)]
pub struct SubscriberSet {
    next_id: AtomicU64,
    registry: Arc<Mutex<Registry>>,
}

impl core::fmt::Debug for SubscriberSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("SubscriberSet")
            .field("global", &registry.global.len())
            .field("jobs", &registry.per_job.len())
            .finish()
    }
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of a single job.
    pub fn subscribe<F>(&self, job_id: JobId, handler: F) -> SubscriptionHandle
    where
        F: Fn(&NativeEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .per_job
            .entry(job_id)
            .or_default()
            .push((id, Arc::new(handler)));
        SubscriptionHandle {
            id,
            scope: Some(job_id),
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Subscribe to events of every job.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&NativeEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().global.push((id, Arc::new(handler)));
        SubscriptionHandle {
            id,
            scope: None,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `event` to its job's subscribers, then to global subscribers.
    ///
    /// Returns the number of handlers that panicked.
    pub fn notify(&self, event: &NativeEvent) -> usize {
        let handlers: Vec<Entry> = {
            let registry = self.lock();
            registry
                .per_job
                .get(&event.job_id())
                .into_iter()
                .flatten()
                .chain(registry.global.iter())
                .cloned()
                .collect()
        };

        let mut failures = 0;
        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                failures += 1;
                error!(
                    job_id = %event.job_id(),
                    event_type = %event.kind(),
                    subscriber = id,
                    "event subscriber panicked"
                );
            }
        }
        failures
    }

    pub fn len(&self) -> usize {
        let registry = self.lock();
        registry.global.len() + registry.per_job.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Returned by `subscribe`/`subscribe_all`.
///
/// Dropping the handle keeps the subscription alive; call
/// [`SubscriptionHandle::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    scope: Option<JobId>,
    registry: Weak<Mutex<Registry>>,
}

impl SubscriptionHandle {
    /// Remove the subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
        let list = match self.scope {
            Some(job_id) => match registry.per_job.get_mut(&job_id) {
                Some(list) => list,
                None => return false,
            },
            None => &mut registry.global,
        };
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        let removed = list.len() != before;

        if let Some(job_id) = self.scope {
            if registry.per_job.get(&job_id).is_some_and(Vec::is_empty) {
                registry.per_job.remove(&job_id);
            }
        }
        removed
    }
}
