//! Single ingress for engine notifications.
//!
//! `emit` drops duplicates (same kind as the job's previous accepted event,
//! less than the dedup window later), forwards the outcome into the
//! [`TaskRegistry`], fans out to subscribers and records bounded history, in
//! that order. Events of one job are processed in the order `emit` is called;
//! callers delivering from several threads serialize per job themselves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use scribeflow_core::JobId;
use scribeflow_events::{
    EventHistory, EventKind, EventPayload, NativeEvent, RawNativeEvent, SubscriberSet,
    SubscriptionHandle,
};

use crate::config::RouterConfig;
use crate::jobs::TaskRegistry;

#[derive(Debug)]
struct RouterState {
    /// Kind and timestamp of the last accepted event per job.
    last_seen: HashMap<JobId, (EventKind, DateTime<Utc>)>,
    history: EventHistory,
}

#[derive(Debug)]
pub struct EventRouter {
    registry: Arc<TaskRegistry>,
    dedup_window: chrono::Duration,
    subscribers: SubscriberSet,
    state: Mutex<RouterState>,
}

impl EventRouter {
    pub fn new(registry: Arc<TaskRegistry>, config: &RouterConfig) -> Self {
        Self {
            registry,
            dedup_window: chrono::Duration::from_std(config.dedup_window())
                .unwrap_or(chrono::Duration::MAX),
            subscribers: SubscriberSet::new(),
            state: Mutex::new(RouterState {
                last_seen: HashMap::new(),
                history: EventHistory::new(config.history_limit),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Route one event. Returns `false` when it was dropped as a duplicate.
    pub fn emit(&self, event: NativeEvent) -> bool {
        if self.is_duplicate(&event) {
            debug!(
                job_id = %event.job_id(),
                event_type = %event.kind(),
                "duplicate event dropped"
            );
            return false;
        }

        self.forward(&event);
        self.subscribers.notify(&event);
        self.lock().history.record(event);
        true
    }

    /// Decode a loosely-typed engine notification and route it.
    ///
    /// Unknown event types and malformed payloads are logged and dropped.
    pub fn emit_raw(&self, raw: RawNativeEvent) -> bool {
        let job_id = raw.job_id;
        match NativeEvent::try_from(raw) {
            Ok(event) => self.emit(event),
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "rejected native event");
                false
            }
        }
    }

    pub fn subscribe<F>(&self, job_id: JobId, handler: F) -> SubscriptionHandle
    where
        F: Fn(&NativeEvent) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(job_id, handler)
    }

    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&NativeEvent) + Send + Sync + 'static,
    {
        self.subscribers.subscribe_all(handler)
    }

    /// Accepted events for `job_id`, oldest first.
    pub fn event_history(&self, job_id: JobId) -> Vec<NativeEvent> {
        self.lock().history.events(job_id)
    }

    pub fn last_event(&self, job_id: JobId) -> Option<NativeEvent> {
        self.lock().history.last(job_id).cloned()
    }

    /// Forget history and dedup state for one job, or for every job.
    pub fn clear_event_history(&self, job_id: Option<JobId>) {
        let mut state = self.lock();
        state.history.clear(job_id);
        match job_id {
            Some(job_id) => {
                state.last_seen.remove(&job_id);
            }
            None => state.last_seen.clear(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn is_duplicate(&self, event: &NativeEvent) -> bool {
        let mut state = self.lock();
        let kind = event.kind();
        let timestamp = event.timestamp();
        if let Some((last_kind, last_at)) = state.last_seen.get(&event.job_id()) {
            if *last_kind == kind && timestamp - *last_at < self.dedup_window {
                return true;
            }
        }
        state.last_seen.insert(event.job_id(), (kind, timestamp));
        false
    }

    fn forward(&self, event: &NativeEvent) {
        let job_id = event.job_id();
        let applied = match event.payload() {
            EventPayload::Progress(progress) => self.registry.report_progress(job_id, *progress),
            EventPayload::Segment(segment) => self.registry.report_segment(job_id, segment),
            EventPayload::Complete(result) => self.registry.report_completion(job_id, result),
            EventPayload::Error(err) => self.registry.report_error(job_id, err),
            EventPayload::Cancelled => self.registry.cancel_job(job_id),
        };
        if !applied {
            debug!(
                job_id = %job_id,
                event_type = %event.kind(),
                "event not applied to registry"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use scribeflow_core::{
        Clock, InferenceError, ManualClock, Segment, SystemClock, TaskId, TranscriptionResult,
    };
    use serde_json::json;

    use crate::jobs::{JobCallbacks, JobKind, JobStatus};

    fn router_with(config: RouterConfig) -> EventRouter {
        let registry = Arc::new(TaskRegistry::new(SystemClock::arc()));
        EventRouter::new(registry, &config)
    }

    fn router() -> EventRouter {
        router_with(RouterConfig::default())
    }

    fn at(base: DateTime<Utc>, ms: i64) -> DateTime<Utc> {
        base + chrono::Duration::milliseconds(ms)
    }

    fn register(router: &EventRouter, callbacks: JobCallbacks) -> JobId {
        let job_id = JobId::new();
        router
            .registry()
            .register_job(job_id, TaskId::new(), JobKind::File, callbacks)
            .unwrap();
        job_id
    }

    fn counting_progress(counter: &Arc<AtomicUsize>) -> JobCallbacks {
        let counter = counter.clone();
        JobCallbacks::new().on_progress(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn same_kind_within_window_is_delivered_once() {
        let router = router();
        let calls = Arc::new(AtomicUsize::new(0));
        let job = register(&router, counting_progress(&calls));
        let t0 = Utc::now();

        assert!(router.emit(NativeEvent::progress(job, 10.0, t0)));
        assert!(!router.emit(NativeEvent::progress(job, 10.0, at(t0, 50))));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(router.event_history(job).len(), 1);
    }

    #[test]
    fn same_kind_outside_window_is_delivered_twice() {
        let router = router();
        let calls = Arc::new(AtomicUsize::new(0));
        let job = register(&router, counting_progress(&calls));
        let t0 = Utc::now();

        router.emit(NativeEvent::progress(job, 10.0, t0));
        router.emit(NativeEvent::progress(job, 10.0, at(t0, 150)));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn different_kinds_are_never_deduplicated() {
        let router = router();
        let job = register(&router, JobCallbacks::new());
        let t0 = Utc::now();

        assert!(router.emit(NativeEvent::progress(job, 10.0, t0)));
        assert!(router.emit(NativeEvent::segment(job, Segment::new("hi", 0, 400), at(t0, 1))));
        assert!(router.emit(NativeEvent::progress(job, 20.0, at(t0, 2))));
    }

    #[test]
    fn dedup_is_per_job() {
        let router = router();
        let a = register(&router, JobCallbacks::new());
        let b = register(&router, JobCallbacks::new());
        let t0 = Utc::now();

        assert!(router.emit(NativeEvent::progress(a, 10.0, t0)));
        assert!(router.emit(NativeEvent::progress(b, 10.0, t0)));
    }

    #[test]
    fn events_translate_into_registry_calls() {
        let router = router();
        let segments = Arc::new(Mutex::new(Vec::new()));
        let texts = Arc::new(Mutex::new(Vec::new()));
        let callbacks = {
            let segments = segments.clone();
            let texts = texts.clone();
            JobCallbacks::new()
                .on_segment(move |_, s| segments.lock().unwrap().push(s.text.clone()))
                .on_complete(move |_, r| texts.lock().unwrap().push(r.text.clone()))
        };
        let job = register(&router, callbacks);
        let t0 = Utc::now();

        router.emit(NativeEvent::progress(job, 42.4, t0));
        assert_eq!(router.registry().get_job(job).unwrap().progress, 42);
        assert_eq!(router.registry().get_job(job).unwrap().status, JobStatus::Processing);

        router.emit(NativeEvent::segment(job, Segment::new("hello", 0, 900), at(t0, 10)));
        router.emit(NativeEvent::complete(
            job,
            TranscriptionResult::new("hello", vec![Segment::new("hello", 0, 900)]),
            at(t0, 20),
        ));

        let meta = router.registry().get_job(job).unwrap();
        assert_eq!(meta.status, JobStatus::Completed);
        assert_eq!(meta.progress, 100);
        assert_eq!(*segments.lock().unwrap(), vec!["hello".to_string()]);
        assert_eq!(*texts.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[test]
    fn error_event_fails_the_job() {
        let router = router();
        let messages = Arc::new(Mutex::new(Vec::new()));
        let callbacks = {
            let messages = messages.clone();
            JobCallbacks::new().on_error(move |_, e| messages.lock().unwrap().push(e.message.clone()))
        };
        let job = register(&router, callbacks);

        router.emit(NativeEvent::error(job, InferenceError::new("decoder crashed"), Utc::now()));

        assert_eq!(router.registry().get_job(job).unwrap().status, JobStatus::Failed);
        assert_eq!(*messages.lock().unwrap(), vec!["decoder crashed".to_string()]);
    }

    #[test]
    fn events_after_cancellation_reach_history_but_not_callbacks() {
        let router = router();
        let completions = Arc::new(AtomicUsize::new(0));
        let callbacks = {
            let completions = completions.clone();
            JobCallbacks::new().on_complete(move |_, _| {
                completions.fetch_add(1, Ordering::SeqCst);
            })
        };
        let job = register(&router, callbacks);
        let t0 = Utc::now();

        router.emit(NativeEvent::cancelled(job, t0));
        router.emit(NativeEvent::complete(job, TranscriptionResult::new("late", vec![]), at(t0, 5)));

        assert_eq!(router.registry().get_job(job).unwrap().status, JobStatus::Cancelled);
        assert_eq!(completions.load(Ordering::SeqCst), 0);
        assert_eq!(router.event_history(job).len(), 2);
        assert_eq!(router.last_event(job).unwrap().kind(), EventKind::Complete);
    }

    #[test]
    fn job_subscribers_run_before_global_and_survive_panics() {
        let router = router();
        let job = register(&router, JobCallbacks::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        router.subscribe_all(move |_| o.lock().unwrap().push("global"));
        router.subscribe(job, |_| panic!("subscriber bug"));
        let o = order.clone();
        router.subscribe(job, move |_| o.lock().unwrap().push("job"));

        assert!(router.emit(NativeEvent::progress(job, 5.0, Utc::now())));
        assert_eq!(*order.lock().unwrap(), vec!["job", "global"]);
        assert_eq!(router.event_history(job).len(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let router = router();
        let job = register(&router, JobCallbacks::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let handle = router.subscribe(job, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let t0 = Utc::now();

        router.emit(NativeEvent::progress(job, 5.0, t0));
        assert!(handle.unsubscribe());
        router.emit(NativeEvent::progress(job, 50.0, at(t0, 500)));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(router.subscriber_count(), 0);
    }

    #[test]
    fn history_is_bounded_per_job() {
        let router = router_with(RouterConfig::default().with_history_limit(3));
        let job = register(&router, JobCallbacks::new());
        let t0 = Utc::now();

        for i in 0..5 {
            router.emit(NativeEvent::progress(job, (i * 10) as f64, at(t0, i * 200)));
        }

        let history = router.event_history(job);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].payload(), &EventPayload::Progress(20.0));
    }

    #[test]
    fn clearing_history_resets_dedup_state() {
        let router = router();
        let job = register(&router, JobCallbacks::new());
        let t0 = Utc::now();

        router.emit(NativeEvent::progress(job, 10.0, t0));
        router.clear_event_history(Some(job));

        assert!(router.event_history(job).is_empty());
        assert!(router.emit(NativeEvent::progress(job, 10.0, at(t0, 10))));
    }

    #[test]
    fn raw_events_are_decoded_at_the_boundary() {
        let router = router();
        let job = register(&router, JobCallbacks::new());
        let clock = ManualClock::starting_now();
        let now = clock.now();

        let malformed = RawNativeEvent::new(job, "progress", json!("half"), now);
        assert!(!router.emit_raw(malformed));
        let unknown = RawNativeEvent::new(job, "telemetry", json!({}), now);
        assert!(!router.emit_raw(unknown));
        assert!(router.event_history(job).is_empty());

        clock.advance(Duration::from_secs(1));
        let error = RawNativeEvent::new(job, "error", json!("model load failed"), clock.now());
        assert!(router.emit_raw(error));
        let meta = router.registry().get_job(job).unwrap();
        assert_eq!(meta.status, JobStatus::Failed);
    }
}
