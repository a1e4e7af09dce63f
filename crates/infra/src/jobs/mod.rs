//! Job lifecycle tracking.

pub mod registry;
pub mod types;

pub use registry::{DEADLINE_EXCEEDED, RegistryError, TaskRegistry};
pub use types::{
    DEFAULT_MAX_RETRIES, JobCallbacks, JobKind, JobMetadata, JobOptions, JobStatistics, JobStatus,
};
