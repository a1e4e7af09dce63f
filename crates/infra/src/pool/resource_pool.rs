//! Class-keyed pool of expensive, non-reentrant engine resources.
//!
//! The `in_use` flag is the only mutual exclusion for a handle. The acquire
//! sequence (find free → evict if at capacity → construct → mark in use) runs
//! under a per-class async lock, so slow construction for one class never
//! blocks another class and two acquirers of the same class never share a
//! resource. The bookkeeping map sits behind a std mutex that is never held
//! across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use scribeflow_core::{Clock, ResourceClass, ResourceId};

use crate::config::PoolConfig;

use super::factory::{ResourceError, ResourceFactory};
use super::resource::{ClassStatistics, Lease, PoolStatistics, PooledResource, ResourceInfo};

/// Pool error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("failed to construct {class} resource: {source}")]
    Construction {
        class: ResourceClass,
        #[source]
        source: ResourceError,
    },
}

type Entries<H> = HashMap<ResourceId, PooledResource<H>>;

pub struct ResourcePool<F: ResourceFactory> {
    factory: F,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    resources: Mutex<Entries<F::Handle>>,
    class_locks: Mutex<HashMap<ResourceClass, Arc<tokio::sync::Mutex<()>>>>,
    created: AtomicU64,
    evicted: AtomicU64,
}

impl<F: ResourceFactory> core::fmt::Debug for ResourcePool<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("config", &self.config)
            .field("resources", &self.entries().len())
            .finish_non_exhaustive()
    }
}

impl<F: ResourceFactory> ResourcePool<F> {
    pub fn new(factory: F, config: PoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            factory,
            config,
            clock,
            resources: Mutex::new(HashMap::new()),
            class_locks: Mutex::new(HashMap::new()),
            created: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Lease a resource of `class`, constructing one if no fresh free resource
    /// exists.
    ///
    /// At capacity the least-recently-accessed free resource is evicted first.
    /// If every resource of the class is in use, a resource is constructed
    /// anyway: the per-class capacity is a soft cap and callers never block on
    /// it.
    pub async fn acquire(&self, class: &ResourceClass) -> Result<Lease<F::Handle>, PoolError> {
        let class_lock = self.class_lock(class);
        let _guard = class_lock.lock().await;

        let now = self.clock.now();
        let max_age = self.config.max_age();

        let (lease, class_total) = {
            let mut entries = self.entries();
            let lease = entries
                .values_mut()
                .find(|r| {
                    r.info.resource_class == *class
                        && !r.info.in_use
                        && !r.info.is_stale(now, max_age)
                })
                .map(|r| r.lease(now));
            let class_total = entries
                .values()
                .filter(|r| r.info.resource_class == *class)
                .count();
            (lease, class_total)
        };

        if let Some(lease) = lease {
            debug!(resource_class = %class, resource_id = %lease.resource_id(), "pooled resource reused");
            return Ok(lease);
        }

        if class_total >= self.config.max_per_class {
            match self.take_lru_free(class) {
                Some(victim) => {
                    info!(
                        resource_class = %class,
                        resource_id = %victim.info.resource_id,
                        "evicting least recently used resource"
                    );
                    self.destroy(victim).await;
                }
                None => warn!(
                    resource_class = %class,
                    in_use = class_total,
                    max_per_class = self.config.max_per_class,
                    "all resources in use, exceeding soft capacity"
                ),
            }
        }

        let handle = self
            .factory
            .create(class)
            .await
            .map_err(|source| PoolError::Construction {
                class: class.clone(),
                source,
            })?;
        self.created.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now();
        let resource_id = ResourceId::new();
        let mut resource = PooledResource {
            info: ResourceInfo {
                resource_id,
                resource_class: class.clone(),
                created_at: now,
                last_accessed_at: now,
                access_count: 0,
                in_use: false,
            },
            handle: Arc::new(handle),
        };
        let lease = resource.lease(now);
        self.entries().insert(resource_id, resource);
        info!(resource_class = %class, resource_id = %resource_id, "resource constructed");
        Ok(lease)
    }

    /// Return a leased resource to the pool. Statistics are kept.
    pub fn release(&self, resource_id: ResourceId) -> bool {
        match self.entries().get_mut(&resource_id) {
            Some(resource) => {
                resource.info.in_use = false;
                true
            }
            None => {
                debug!(resource_id = %resource_id, "release of unknown resource ignored");
                false
            }
        }
    }

    /// Destroy a resource regardless of `in_use` (corrupted or errored handle).
    pub async fn invalidate(&self, resource_id: ResourceId) -> bool {
        let removed = self.entries().remove(&resource_id);
        match removed {
            Some(resource) => {
                warn!(
                    resource_class = %resource.info.resource_class,
                    resource_id = %resource_id,
                    in_use = resource.info.in_use,
                    "resource invalidated"
                );
                self.destroy(resource).await;
                true
            }
            None => false,
        }
    }

    /// Destroy every free resource older than `max_age`. Returns the count.
    pub async fn evict_stale(&self) -> usize {
        let now = self.clock.now();
        let max_age = self.config.max_age();
        let stale = self.drain(|info| !info.in_use && info.is_stale(now, max_age));
        let count = stale.len();
        for resource in stale {
            self.destroy(resource).await;
        }
        self.evicted.fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            info!(evicted = count, "stale resources evicted");
        }
        count
    }

    /// Destroy every free resource. Leased resources are left alone.
    pub async fn clear(&self) -> usize {
        let free = self.drain(|info| !info.in_use);
        let count = free.len();
        for resource in free {
            self.destroy(resource).await;
        }
        count
    }

    pub fn resource_info(&self, resource_id: ResourceId) -> Option<ResourceInfo> {
        self.entries().get(&resource_id).map(|r| r.info.clone())
    }

    pub fn statistics(&self) -> PoolStatistics {
        let now = self.clock.now();
        let entries = self.entries();
        let mut stats = PoolStatistics {
            total_resources: entries.len(),
            created: self.created.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            ..PoolStatistics::default()
        };

        let mut total_age_ms = 0.0;
        for resource in entries.values() {
            let info = &resource.info;
            let class: &mut ClassStatistics = stats
                .per_class
                .entry(info.resource_class.to_string())
                .or_default();
            class.total += 1;
            if info.in_use {
                class.in_use += 1;
                stats.in_use += 1;
            }
            stats.total_accesses += info.access_count;
            total_age_ms += info.age(now).as_secs_f64() * 1000.0;
        }

        if stats.total_resources > 0 {
            let n = stats.total_resources as f64;
            stats.average_access_count = stats.total_accesses as f64 / n;
            stats.average_age_ms = total_age_ms / n;
        }
        if stats.total_accesses > 0 {
            stats.reuse_rate = stats
                .total_accesses
                .saturating_sub(stats.total_resources as u64) as f64
                / stats.total_accesses as f64;
        }
        stats
    }

    fn take_lru_free(&self, class: &ResourceClass) -> Option<PooledResource<F::Handle>> {
        let mut entries = self.entries();
        let victim = entries
            .values()
            .filter(|r| r.info.resource_class == *class && !r.info.in_use)
            .min_by_key(|r| r.info.last_accessed_at)
            .map(|r| r.info.resource_id)?;
        self.evicted.fetch_add(1, Ordering::Relaxed);
        entries.remove(&victim)
    }

    fn drain(&self, pred: impl Fn(&ResourceInfo) -> bool) -> Vec<PooledResource<F::Handle>> {
        let mut entries = self.entries();
        let ids: Vec<ResourceId> = entries
            .values()
            .filter(|r| pred(&r.info))
            .map(|r| r.info.resource_id)
            .collect();
        ids.iter().filter_map(|id| entries.remove(id)).collect()
    }

    async fn destroy(&self, resource: PooledResource<F::Handle>) {
        let PooledResource { info, handle } = resource;
        if let Err(err) = self.factory.destroy(&info.resource_class, handle).await {
            warn!(
                resource_class = %info.resource_class,
                resource_id = %info.resource_id,
                error = %err,
                "resource destructor failed"
            );
        }
    }

    fn class_lock(&self, class: &ResourceClass) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.class_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(class.clone()).or_default())
    }

    fn entries(&self) -> MutexGuard<'_, Entries<F::Handle>> {
        self.resources.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use scribeflow_core::ManualClock;

    /// Fake engine context: records which class it was built for.
    #[derive(Debug)]
    struct FakeContext {
        class: ResourceClass,
    }

    #[derive(Debug, Default)]
    struct FakeFactory {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        fail_class: Option<&'static str>,
        build_delay: Option<Duration>,
    }

    #[async_trait]
    impl ResourceFactory for FakeFactory {
        type Handle = FakeContext;

        async fn create(&self, class: &ResourceClass) -> Result<FakeContext, ResourceError> {
            if let Some(delay) = self.build_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_class == Some(class.as_str()) {
                return Err(ResourceError::new("model file not found"));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(FakeContext {
                class: class.clone(),
            })
        }

        async fn destroy(
            &self,
            _class: &ResourceClass,
            _handle: Arc<FakeContext>,
        ) -> Result<(), ResourceError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool(
        factory: FakeFactory,
        config: PoolConfig,
    ) -> (ResourcePool<Arc<FakeFactory>>, Arc<FakeFactory>, Arc<ManualClock>) {
        let factory = Arc::new(factory);
        let clock = ManualClock::starting_now();
        (
            ResourcePool::new(factory.clone(), config, clock.clone()),
            factory,
            clock,
        )
    }

    #[tokio::test]
    async fn released_resource_is_reused() {
        let (pool, factory, _clock) = pool(FakeFactory::default(), PoolConfig::default());
        let class = ResourceClass::new("base");

        let first = pool.acquire(&class).await.unwrap();
        assert_eq!(first.handle().class, class);
        assert!(pool.release(first.resource_id()));
        let second = pool.acquire(&class).await.unwrap();

        assert_eq!(first.resource_id(), second.resource_id());
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.resource_info(second.resource_id()).unwrap().access_count, 2);
    }

    #[tokio::test]
    async fn held_resources_are_never_shared() {
        let factory = FakeFactory {
            build_delay: Some(Duration::from_millis(10)),
            ..FakeFactory::default()
        };
        let (pool, factory, _clock) = pool(factory, PoolConfig::default());
        let class = ResourceClass::new("base");

        let (a, b) = tokio::join!(pool.acquire(&class), pool.acquire(&class));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.resource_id(), b.resource_id());
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.statistics().in_use, 2);
    }

    #[tokio::test]
    async fn concurrent_acquires_never_share_one_free_resource() {
        let (pool, factory, _clock) = pool(FakeFactory::default(), PoolConfig::default());
        let class = ResourceClass::new("small");
        let lease = pool.acquire(&class).await.unwrap();
        pool.release(lease.resource_id());

        let (a, b) = tokio::join!(pool.acquire(&class), pool.acquire(&class));
        let (a, b) = (a.unwrap().resource_id(), b.unwrap().resource_id());
        assert_ne!(a, b);
        assert!(a == lease.resource_id() || b == lease.resource_id());
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_free_resource_is_skipped_below_capacity() {
        let config = PoolConfig::default()
            .with_max_per_class(4)
            .with_max_age(Duration::from_secs(60));
        let (pool, factory, clock) = pool(FakeFactory::default(), config);
        let class = ResourceClass::new("base");

        let old = pool.acquire(&class).await.unwrap();
        pool.release(old.resource_id());
        clock.advance(Duration::from_secs(61));

        let fresh = pool.acquire(&class).await.unwrap();
        assert_ne!(fresh.resource_id(), old.resource_id());
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 0);

        let stale = pool.resource_info(old.resource_id()).unwrap();
        assert!(!stale.in_use);
        assert_eq!(stale.access_count, 1);
        assert_eq!(pool.statistics().evicted, 0);
    }

    #[tokio::test]
    async fn at_capacity_evicts_least_recently_used_free_resource() {
        let config = PoolConfig::default()
            .with_max_per_class(2)
            .with_max_age(Duration::from_secs(60));
        let (pool, factory, clock) = pool(FakeFactory::default(), config);
        let class = ResourceClass::new("base");

        let a = pool.acquire(&class).await.unwrap();
        clock.advance(Duration::from_secs(1));
        let b = pool.acquire(&class).await.unwrap();
        pool.release(a.resource_id());
        pool.release(b.resource_id());

        // Both age out; `a` was accessed first so it is evicted.
        clock.advance(Duration::from_secs(120));
        let c = pool.acquire(&class).await.unwrap();

        assert!(pool.resource_info(a.resource_id()).is_none());
        assert!(pool.resource_info(b.resource_id()).is_some());
        assert_ne!(c.resource_id(), b.resource_id());
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.statistics().evicted, 1);
    }

    #[tokio::test]
    async fn full_class_of_busy_resources_exceeds_soft_cap() {
        let config = PoolConfig::default().with_max_per_class(1);
        let (pool, factory, _clock) = pool(FakeFactory::default(), config);
        let class = ResourceClass::new("large");

        let _a = pool.acquire(&class).await.unwrap();
        let _b = pool.acquire(&class).await.unwrap();

        assert_eq!(pool.statistics().per_class["large"].total, 2);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn classes_are_pooled_separately() {
        let (pool, _factory, _clock) = pool(FakeFactory::default(), PoolConfig::default());
        let base = pool.acquire(&ResourceClass::new("base")).await.unwrap();
        pool.release(base.resource_id());
        let tiny = pool.acquire(&ResourceClass::new("tiny")).await.unwrap();

        assert_ne!(base.resource_id(), tiny.resource_id());
        let stats = pool.statistics();
        assert_eq!(stats.per_class.len(), 2);
        assert_eq!(stats.per_class["tiny"].in_use, 1);
        assert_eq!(stats.per_class["base"].in_use, 0);
    }

    #[tokio::test]
    async fn invalidate_destroys_even_when_in_use() {
        let (pool, factory, _clock) = pool(FakeFactory::default(), PoolConfig::default());
        let lease = pool.acquire(&ResourceClass::new("base")).await.unwrap();

        assert!(pool.invalidate(lease.resource_id()).await);
        assert!(!pool.invalidate(lease.resource_id()).await);
        assert!(!pool.release(lease.resource_id()));
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.statistics().total_resources, 0);
    }

    #[tokio::test]
    async fn evict_stale_sweeps_only_free_old_resources() {
        let config = PoolConfig::default().with_max_age(Duration::from_secs(60));
        let (pool, factory, clock) = pool(FakeFactory::default(), config);
        let class = ResourceClass::new("base");

        let free = pool.acquire(&class).await.unwrap();
        let _busy = pool.acquire(&class).await.unwrap();
        pool.release(free.resource_id());

        clock.advance(Duration::from_secs(61));
        assert_eq!(pool.evict_stale().await, 1);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.statistics().total_resources, 1);
    }

    #[tokio::test]
    async fn construction_failure_leaves_no_entry() {
        let factory = FakeFactory {
            fail_class: Some("missing"),
            ..FakeFactory::default()
        };
        let (pool, _factory, _clock) = pool(factory, PoolConfig::default());

        let err = pool.acquire(&ResourceClass::new("missing")).await.unwrap_err();
        assert!(matches!(err, PoolError::Construction { .. }));
        assert_eq!(pool.statistics().total_resources, 0);
    }

    #[tokio::test]
    async fn reuse_rate_counts_repeat_accesses() {
        let (pool, _factory, clock) = pool(FakeFactory::default(), PoolConfig::default());
        let class = ResourceClass::new("base");
        for _ in 0..4 {
            let lease = pool.acquire(&class).await.unwrap();
            pool.release(lease.resource_id());
        }
        clock.advance(Duration::from_secs(10));

        let stats = pool.statistics();
        assert_eq!(stats.total_accesses, 4);
        assert!((stats.reuse_rate - 0.75).abs() < 1e-9);
        assert!((stats.average_access_count - 4.0).abs() < 1e-9);
        assert!((stats.average_age_ms - 10_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn clear_keeps_leased_resources() {
        let (pool, _factory, _clock) = pool(FakeFactory::default(), PoolConfig::default());
        let class = ResourceClass::new("base");
        let free = pool.acquire(&class).await.unwrap();
        let busy = pool.acquire(&class).await.unwrap();
        pool.release(free.resource_id());

        assert_eq!(pool.clear().await, 1);
        assert!(pool.resource_info(busy.resource_id()).is_some());
    }
}
