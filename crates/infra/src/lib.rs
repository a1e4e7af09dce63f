//! Orchestration layer between an application and a native inference engine:
//! job registry, resource pool, event routing and failure recovery.

pub mod config;
pub mod jobs;
pub mod orchestrator;
pub mod pool;
pub mod recovery;
pub mod router;


pub use config::OrchestratorConfig;
pub use jobs::TaskRegistry;
pub use orchestrator::{
    AudioInput, DispatchRequest, InferenceDispatcher, Orchestrator, OrchestratorError,
    SubmitOutcome, SubmitRequest, TranscriptionParams,
};
pub use pool::{ResourceFactory, ResourcePool};
pub use recovery::RecoveryPolicyEngine;
pub use router::EventRouter;
