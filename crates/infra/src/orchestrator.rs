//! Composition root wiring the registry, pool, router and recovery engine.
//!
//! Every collaborator is constructed explicitly and injected; several
//! orchestrators can coexist in one process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use scribeflow_core::{Clock, InferenceError, JobId, ResourceClass, ResourceId, TaskId};

use crate::config::OrchestratorConfig;
use crate::jobs::{JobCallbacks, JobKind, JobOptions, JobStatistics, RegistryError, TaskRegistry};
use crate::pool::{PoolStatistics, ResourceFactory, ResourcePool};
use crate::recovery::{RecoveryPolicyEngine, RecoveryStatistics, RecoveryStrategy};
use crate::router::EventRouter;

/// Error code for jobs failed because no engine resource could be built.
pub const RESOURCE_UNAVAILABLE: &str = "RESOURCE_UNAVAILABLE";

/// Audio handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioInput {
    /// Mono PCM samples.
    Samples { samples: Vec<f32>, sample_rate: u32 },
    File(PathBuf),
}

/// Decoding parameters passed through to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionParams {
    /// `None` lets the engine detect the language.
    pub language: Option<String>,
    pub translate: bool,
    pub max_tokens: Option<u32>,
    pub suppress_blank: bool,
    pub suppress_non_speech: bool,
    pub use_vad: bool,
}

impl Default for TranscriptionParams {
    fn default() -> Self {
        Self {
            language: None,
            translate: false,
            max_tokens: None,
            suppress_blank: true,
            suppress_non_speech: false,
            use_vad: false,
        }
    }
}

/// What the engine receives for one job.
#[derive(Debug)]
pub struct DispatchRequest<H> {
    pub job_id: JobId,
    pub handle: Arc<H>,
    pub input: AudioInput,
    pub params: TranscriptionParams,
}

/// The external inference engine.
///
/// `dispatch` starts work and returns; the engine then reports zero or more
/// progress/segment events and exactly one terminal event through `events`.
/// An `Err` means the job never started.
#[async_trait]
pub trait InferenceDispatcher<H>: Send + Sync + 'static
where
    H: Send + Sync + 'static,
{
    async fn dispatch(
        &self,
        request: DispatchRequest<H>,
        events: Arc<EventRouter>,
    ) -> Result<(), InferenceError>;
}

/// A unit of work from the application.
#[derive(Debug)]
pub struct SubmitRequest {
    pub task_id: TaskId,
    pub kind: JobKind,
    pub resource_class: ResourceClass,
    pub input: AudioInput,
    pub params: TranscriptionParams,
    pub callbacks: JobCallbacks,
    /// Overrides the configured registry defaults.
    pub options: Option<JobOptions>,
}

impl SubmitRequest {
    pub fn new(
        task_id: TaskId,
        kind: JobKind,
        resource_class: impl Into<ResourceClass>,
        input: AudioInput,
    ) -> Self {
        Self {
            task_id,
            kind,
            resource_class: resource_class.into(),
            input,
            params: TranscriptionParams::default(),
            callbacks: JobCallbacks::default(),
            options: None,
        }
    }

    pub fn with_params(mut self, params: TranscriptionParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_callbacks(mut self, callbacks: JobCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Result of [`Orchestrator::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The engine accepted the job; results arrive through the callbacks.
    Dispatched { job_id: JobId, resource_id: ResourceId },
    /// The job failed before the engine started it. The caller decides whether
    /// to re-submit, guided by `strategy` and `retry_after`.
    Rejected {
        job_id: JobId,
        error: InferenceError,
        strategy: RecoveryStrategy,
        retry_after: Option<Duration>,
    },
}

impl SubmitOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            SubmitOutcome::Dispatched { job_id, .. } | SubmitOutcome::Rejected { job_id, .. } => {
                *job_id
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorStatistics {
    pub jobs: JobStatistics,
    pub pool: PoolStatistics,
    pub recovery: RecoveryStatistics,
}

type Leases = Arc<Mutex<HashMap<JobId, ResourceId>>>;

pub struct Orchestrator<F, D>
where
    F: ResourceFactory,
    D: InferenceDispatcher<F::Handle>,
{
    config: OrchestratorConfig,
    registry: Arc<TaskRegistry>,
    pool: Arc<ResourcePool<F>>,
    router: Arc<EventRouter>,
    recovery: Arc<RecoveryPolicyEngine>,
    dispatcher: D,
    /// Resource leased by each dispatched job until its terminal event.
    leases: Leases,
}

impl<F, D> core::fmt::Debug for Orchestrator<F, D>
where
    F: ResourceFactory,
    D: InferenceDispatcher<F::Handle>,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .field("leases", &lock(&self.leases).len())
            .finish_non_exhaustive()
    }
}

impl<F, D> Orchestrator<F, D>
where
    F: ResourceFactory,
    D: InferenceDispatcher<F::Handle>,
{
    pub fn new(config: OrchestratorConfig, factory: F, dispatcher: D, clock: Arc<dyn Clock>) -> Self {
        let recovery = RecoveryPolicyEngine::new(config.recovery.clone(), Arc::clone(&clock));
        Self::with_recovery(config, factory, dispatcher, clock, recovery)
    }

    /// Like [`Orchestrator::new`] with a preconfigured recovery engine (custom
    /// handlers or a seeded rng).
    pub fn with_recovery(
        config: OrchestratorConfig,
        factory: F,
        dispatcher: D,
        clock: Arc<dyn Clock>,
        recovery: RecoveryPolicyEngine,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::with_defaults(
            Arc::clone(&clock),
            config.registry.job_options(),
        ));
        let pool = Arc::new(ResourcePool::new(factory, config.pool.clone(), clock));
        let router = Arc::new(EventRouter::new(Arc::clone(&registry), &config.router));
        let leases: Leases = Arc::new(Mutex::new(HashMap::new()));

        // Engine terminal events hand the job's resource back to the pool.
        let weak_pool: Weak<ResourcePool<F>> = Arc::downgrade(&pool);
        let job_leases = Arc::clone(&leases);
        router.subscribe_all(move |event| {
            if !event.kind().is_terminal() {
                return;
            }
            let Some(resource_id) = lock(&job_leases).remove(&event.job_id()) else {
                return;
            };
            if let Some(pool) = weak_pool.upgrade() {
                pool.release(resource_id);
                debug!(job_id = %event.job_id(), resource_id = %resource_id, "resource released");
            }
        });

        Self {
            config,
            registry,
            pool,
            router,
            recovery: Arc::new(recovery),
            dispatcher,
            leases,
        }
    }

    /// Register, lease a resource and dispatch one job.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, OrchestratorError> {
        let SubmitRequest {
            task_id,
            kind,
            resource_class,
            input,
            params,
            callbacks,
            options,
        } = request;

        let job_id = JobId::new();
        let options = options.unwrap_or_else(|| self.config.registry.job_options());
        self.registry
            .register_job_with(job_id, task_id, kind, callbacks, options)?;
        self.registry.mark_initializing(job_id);

        let lease = match self.pool.acquire(&resource_class).await {
            Ok(lease) => lease,
            Err(err) => {
                warn!(job_id = %job_id, resource_class = %resource_class, error = %err, "no engine resource");
                let failure = InferenceError::with_code(RESOURCE_UNAVAILABLE, err.to_string());
                return Ok(self.reject(job_id, failure));
            }
        };
        let resource_id = lease.resource_id();
        self.registry.attach_context(job_id, resource_id);
        lock(&self.leases).insert(job_id, resource_id);

        let request = DispatchRequest {
            job_id,
            handle: Arc::clone(lease.handle()),
            input,
            params,
        };
        match self
            .dispatcher
            .dispatch(request, Arc::clone(&self.router))
            .await
        {
            Ok(()) => {
                info!(job_id = %job_id, task_id = %task_id, resource_id = %resource_id, "job dispatched");
                Ok(SubmitOutcome::Dispatched {
                    job_id,
                    resource_id,
                })
            }
            Err(failure) => {
                lock(&self.leases).remove(&job_id);
                self.pool.invalidate(resource_id).await;
                Ok(self.reject(job_id, failure))
            }
        }
    }

    /// Mark a job cancelled. The engine keeps its resource until it reports a
    /// terminal event.
    pub fn cancel(&self, job_id: JobId) -> bool {
        self.registry.cancel_job(job_id)
    }

    /// Fail every job past its deadline and destroy the resources they held.
    /// Returns the expired job ids.
    ///
    /// An overdue engine is presumed hung, so its resource is invalidated
    /// rather than returned to the pool. A terminal event arriving later finds
    /// no lease and releases nothing.
    pub async fn expire_overdue(&self) -> Vec<JobId> {
        let expired = self.registry.expire_overdue();
        for job_id in &expired {
            let lease = lock(&self.leases).remove(job_id);
            warn!(job_id = %job_id, resource_id = ?lease, "job deadline exceeded");
            if let Some(resource_id) = lease {
                self.pool.invalidate(resource_id).await;
            }
        }
        expired
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ResourcePool<F>> {
        &self.pool
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn recovery(&self) -> &Arc<RecoveryPolicyEngine> {
        &self.recovery
    }

    /// Resource currently leased by a dispatched job.
    pub fn leased_resource(&self, job_id: JobId) -> Option<ResourceId> {
        lock(&self.leases).get(&job_id).copied()
    }

    pub fn statistics(&self) -> OrchestratorStatistics {
        OrchestratorStatistics {
            jobs: self.registry.statistics(),
            pool: self.pool.statistics(),
            recovery: self.recovery.statistics(),
        }
    }

    fn reject(&self, job_id: JobId, failure: InferenceError) -> SubmitOutcome {
        self.registry.report_error(job_id, &failure);
        let (strategy, retry_after) = match self.registry.get_job(job_id) {
            Some(job) => {
                let strategy = self.recovery.handle(&failure, &job);
                // Both the job's budget and the strategy's own policy must allow it.
                let policy_allows = strategy
                    .retry
                    .is_some_and(|policy| policy.should_retry(job.retry_count));
                let retry_after = if policy_allows && self.recovery.should_retry(&job) {
                    self.recovery.delay_for(&strategy, &job)
                } else {
                    None
                };
                (strategy, retry_after)
            }
            None => (RecoveryStrategy::cancel(), None),
        };
        SubmitOutcome::Rejected {
            job_id,
            error: failure,
            strategy,
            retry_after,
        }
    }
}

fn lock(leases: &Leases) -> MutexGuard<'_, HashMap<JobId, ResourceId>> {
    leases.lock().unwrap_or_else(|e| e.into_inner())
}
