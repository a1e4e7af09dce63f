//! Pooled resource bookkeeping and leases.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use scribeflow_core::clock::elapsed;
use scribeflow_core::{ResourceClass, ResourceId};

/// Bookkeeping for one pooled resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub resource_id: ResourceId,
    pub resource_class: ResourceClass,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    /// At most one lease holds the resource while this is set.
    pub in_use: bool,
}

impl ResourceInfo {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.created_at, now)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now) >= max_age
    }
}

#[derive(Debug)]
pub(crate) struct PooledResource<H> {
    pub(crate) info: ResourceInfo,
    pub(crate) handle: Arc<H>,
}

impl<H> PooledResource<H> {
    pub(crate) fn lease(&mut self, now: DateTime<Utc>) -> Lease<H> {
        self.info.in_use = true;
        self.info.access_count += 1;
        self.info.last_accessed_at = now;
        Lease {
            resource_id: self.info.resource_id,
            resource_class: self.info.resource_class.clone(),
            handle: Arc::clone(&self.handle),
        }
    }
}

/// Exclusive use of a pooled resource until `ResourcePool::release`.
#[derive(Debug)]
pub struct Lease<H> {
    resource_id: ResourceId,
    resource_class: ResourceClass,
    handle: Arc<H>,
}

impl<H> Lease<H> {
    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    pub fn resource_class(&self) -> &ResourceClass {
        &self.resource_class
    }

    pub fn handle(&self) -> &Arc<H> {
        &self.handle
    }
}

/// Per-class resource counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassStatistics {
    pub total: usize,
    pub in_use: usize,
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStatistics {
    pub total_resources: usize,
    pub in_use: usize,
    pub per_class: BTreeMap<String, ClassStatistics>,
    pub total_accesses: u64,
    pub average_access_count: f64,
    pub average_age_ms: f64,
    /// `(total_accesses - total_resources) / total_accesses`; 0 with no accesses.
    pub reuse_rate: f64,
    pub created: u64,
    pub evicted: u64,
}
