//! Pooling of expensive engine resources.

pub mod factory;
pub mod resource;
pub mod resource_pool;

pub use factory::{ResourceError, ResourceFactory};
pub use resource::{ClassStatistics, Lease, PoolStatistics, ResourceInfo};
pub use resource_pool::{PoolError, ResourcePool};
