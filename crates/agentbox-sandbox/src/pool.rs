//! Reuse cache of live sandbox instances keyed by image.
//!
//! A caller holds a [`PoolLease`] between `acquire` and release; an instance
//! is never leased twice at once. `max_size` is a soft cap: when every
//! instance is in use, `acquire` creates one anyway. Instances still being
//! created count against the cap, so concurrent acquires evict idle
//! instances instead of overshooting.

use crate::catalog::SandboxRegistry;
use crate::error::{SandboxError, SandboxResult};
use crate::SandboxProvider;
use agentbox_core::ProviderResult;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Builds a fresh, uninitialized sandbox for the pool.
pub type SandboxFactory =
    Arc<dyn Fn(&Value) -> ProviderResult<Arc<dyn SandboxProvider>> + Send + Sync>;

/// Point-in-time pool counters. `total == in_use + available`, and
/// `by_image` sums to `total`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub available: usize,
    pub max_size: usize,
    pub by_image: BTreeMap<String, usize>,
}

struct PooledSandbox {
    id: String,
    last_used: Instant,
    in_use: bool,
    provider: Arc<dyn SandboxProvider>,
}

#[derive(Default)]
struct PoolState {
    buckets: HashMap<String, Vec<PooledSandbox>>,
    /// Acquires past the capacity check whose instance is not inserted yet.
    pending: usize,
}

impl PoolState {
    fn total(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    fn reserved(&self) -> usize {
        self.total() + self.pending
    }

    /// Mark an idle instance for `image` in use and return it.
    fn checkout(&mut self, image: &str) -> Option<(String, Arc<dyn SandboxProvider>)> {
        let entry = self
            .buckets
            .get_mut(image)?
            .iter_mut()
            .find(|entry| !entry.in_use)?;
        entry.in_use = true;
        entry.last_used = Instant::now();
        Some((entry.id.clone(), Arc::clone(&entry.provider)))
    }

    /// Remove the least recently used idle instance across every image.
    fn evict_oldest_idle(&mut self) -> Option<PooledSandbox> {
        let (image, index) = self
            .buckets
            .iter()
            .flat_map(|(image, entries)| {
                entries
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| !entry.in_use)
                    .map(move |(index, entry)| (image, index, entry.last_used))
            })
            .min_by_key(|(_, _, last_used)| *last_used)
            .map(|(image, index, _)| (image.clone(), index))?;

        let bucket = self.buckets.get_mut(&image)?;
        let evicted = bucket.remove(index);
        if bucket.is_empty() {
            self.buckets.remove(&image);
        }
        Some(evicted)
    }

    fn checkin(&mut self, image: &str, id: &str) {
        if let Some(entry) = self
            .buckets
            .get_mut(image)
            .and_then(|entries| entries.iter_mut().find(|entry| entry.id == id))
        {
            entry.in_use = false;
            entry.last_used = Instant::now();
        }
    }
}

struct PoolInner {
    max_size: usize,
    factory: SandboxFactory,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// A capacity slot taken by an in-flight creation. Released on drop unless
/// the instance was inserted.
struct PendingSlot<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.state();
            state.pending = state.pending.saturating_sub(1);
        }
    }
}

/// Pool of sandbox instances.
#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl SandboxPool {
    pub fn new<F>(max_size: usize, factory: F) -> Self
    where
        F: Fn(&Value) -> ProviderResult<Arc<dyn SandboxProvider>> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PoolInner {
                max_size: max_size.max(1),
                factory: Arc::new(factory),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// A pool creating instances of `provider_type` through `registry`.
    pub fn for_registry(
        registry: Arc<SandboxRegistry>,
        provider_type: impl Into<String>,
        max_size: usize,
    ) -> Self {
        let provider_type = provider_type.into();
        Self::new(max_size, move |config| registry.create(&provider_type, config))
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Lease an instance for `image`, reusing an idle one when possible.
    pub async fn acquire(&self, image: &str, config: &Value) -> SandboxResult<PoolLease> {
        let evicted = {
            let mut state = self.inner.state();
            if let Some((id, provider)) = state.checkout(image) {
                debug!(id = %id, image = %image, "Reusing pooled sandbox");
                return Ok(self.lease(id, image, provider));
            }
            let evicted = if state.reserved() >= self.inner.max_size {
                state.evict_oldest_idle()
            } else {
                None
            };
            state.pending += 1;
            evicted
        };
        let mut slot = PendingSlot {
            inner: &self.inner,
            armed: true,
        };

        if let Some(evicted) = evicted {
            info!(id = %evicted.id, "Evicting idle pooled sandbox");
            if let Err(e) = evicted.provider.shutdown().await {
                warn!(id = %evicted.id, error = %e, "Failed to stop evicted sandbox");
            }
        }

        let provider = (self.inner.factory)(config)?;
        provider
            .init(config)
            .await
            .map_err(SandboxError::Provider)?;

        let id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.inner.state();
            state.pending = state.pending.saturating_sub(1);
            slot.armed = false;
            state
                .buckets
                .entry(image.to_string())
                .or_default()
                .push(PooledSandbox {
                    id: id.clone(),
                    last_used: Instant::now(),
                    in_use: true,
                    provider: Arc::clone(&provider),
                });
            if state.total() > self.inner.max_size {
                debug!(
                    total = state.total(),
                    max_size = self.inner.max_size,
                    "Pool above capacity, every instance is in use"
                );
            }
        }
        info!(id = %id, image = %image, "Created pooled sandbox");
        Ok(self.lease(id, image, provider))
    }

    fn lease(&self, id: String, image: &str, provider: Arc<dyn SandboxProvider>) -> PoolLease {
        PoolLease {
            id,
            image: image.to_string(),
            provider,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Return a leased instance to the pool. The instance stays running.
    pub fn release(&self, lease: PoolLease) {
        drop(lease);
    }

    /// Stop every instance concurrently and empty the pool.
    pub async fn stop_all(&self) {
        let entries: Vec<PooledSandbox> = {
            let mut state = self.inner.state();
            state.buckets.drain().flat_map(|(_, entries)| entries).collect()
        };
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "Stopping pooled sandboxes");
        let stops = entries.iter().map(|entry| async move {
            if let Err(e) = entry.provider.shutdown().await {
                warn!(id = %entry.id, error = %e, "Failed to stop pooled sandbox");
            }
        });
        futures::future::join_all(stops).await;
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();
        let mut stats = PoolStats {
            max_size: self.inner.max_size,
            ..Default::default()
        };
        for (image, entries) in &state.buckets {
            let in_use = entries.iter().filter(|e| e.in_use).count();
            stats.total += entries.len();
            stats.in_use += in_use;
            stats.available += entries.len() - in_use;
            stats.by_image.insert(image.clone(), entries.len());
        }
        stats
    }
}

/// Exclusive use of a pooled sandbox. Returned to the pool on drop.
pub struct PoolLease {
    id: String,
    image: String,
    provider: Arc<dyn SandboxProvider>,
    pool: Weak<PoolInner>,
}

impl PoolLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }
}

impl Deref for PoolLease {
    type Target = dyn SandboxProvider;

    fn deref(&self) -> &Self::Target {
        self.provider.as_ref()
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.state().checkin(&self.image, &self.id);
        }
    }
}

impl std::fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease")
            .field("id", &self.id)
            .field("image", &self.image)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SandboxExecOptions, SandboxExecResult, VolumeMount};
    use agentbox_core::{
        IsolationLevel, Provider, ProviderCapabilities, ProviderError, SandboxCapabilities,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        stopped: AtomicUsize,
    }

    struct Counted {
        serial: usize,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Provider for Counted {
        fn provider_type(&self) -> &str {
            "counted"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn init(&self, config: &Value) -> ProviderResult<()> {
            if let Some(ms) = config.get("delayMs").and_then(Value::as_u64) {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            }
            if config.get("fail").is_some() {
                return Err(ProviderError::init_failed("counted", "asked to fail"));
            }
            Ok(())
        }

        async fn shutdown(&self) -> ProviderResult<()> {
            self.counters.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities::Sandbox(self.sandbox_capabilities())
        }
    }

    #[async_trait]
    impl SandboxProvider for Counted {
        async fn exec(&self, _options: SandboxExecOptions) -> SandboxExecResult {
            SandboxExecResult {
                stdout: self.serial.to_string(),
                ..Default::default()
            }
        }

        async fn set_volumes(&self, _mounts: Vec<VolumeMount>) -> SandboxResult<()> {
            Ok(())
        }

        fn sandbox_capabilities(&self) -> SandboxCapabilities {
            SandboxCapabilities {
                isolation: IsolationLevel::Vm,
                runtimes: Vec::new(),
                pooling: true,
                volume_mounts: false,
                networking: false,
            }
        }
    }

    fn pool(max_size: usize) -> (SandboxPool, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let shared = counters.clone();
        let pool = SandboxPool::new(max_size, move |_config| {
            let serial = shared.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Arc::new(Counted {
                serial,
                counters: shared.clone(),
            }) as Arc<dyn SandboxProvider>)
        });
        (pool, counters)
    }

    fn assert_invariant(stats: &PoolStats) {
        assert_eq!(stats.total, stats.in_use + stats.available);
        assert_eq!(stats.total, stats.by_image.values().sum::<usize>());
    }

    #[tokio::test]
    async fn test_leases_are_exclusive() {
        let (pool, counters) = pool(1);

        let first = pool.acquire("node:18-alpine", &Value::Null).await.unwrap();
        let second = pool.acquire("node:18-alpine", &Value::Null).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);

        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.in_use, 2);
        assert_invariant(&stats);
    }

    #[tokio::test]
    async fn test_release_allows_reuse() {
        let (pool, counters) = pool(2);

        let lease = pool.acquire("python:3.12-slim", &Value::Null).await.unwrap();
        let id = lease.id().to_string();
        pool.release(lease);

        let again = pool.acquire("python:3.12-slim", &Value::Null).await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.exec(SandboxExecOptions::new("x")).await.stdout, "1");
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_evicts_oldest_idle_at_capacity() {
        let (pool, counters) = pool(2);

        let a = pool.acquire("image-a", &Value::Null).await.unwrap();
        let b = pool.acquire("image-b", &Value::Null).await.unwrap();
        let a_id = a.id().to_string();
        drop(a);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        drop(b);

        let c = pool.acquire("image-c", &Value::Null).await.unwrap();
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);

        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert!(!stats.by_image.contains_key("image-a"));
        assert_eq!(stats.by_image.get("image-b"), Some(&1));
        assert_eq!(stats.by_image.get("image-c"), Some(&1));
        assert_invariant(&stats);
        assert_ne!(c.id(), a_id);
        drop(c);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_respect_capacity() {
        let (pool, counters) = pool(2);
        drop(pool.acquire("a", &Value::Null).await.unwrap());

        let slow = serde_json::json!({"delayMs": 20});
        let (b, c) = tokio::join!(pool.acquire("b", &slow), pool.acquire("c", &slow));
        let (b, c) = (b.unwrap(), c.unwrap());

        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.in_use, 2);
        assert!(!stats.by_image.contains_key("a"));
        assert_invariant(&stats);
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
        drop((b, c));
    }

    #[tokio::test]
    async fn test_failed_creation_frees_its_slot() {
        let (pool, _counters) = pool(1);
        assert!(pool
            .acquire("a", &serde_json::json!({"fail": true}))
            .await
            .is_err());

        let held = pool.acquire("a", &Value::Null).await.unwrap();
        drop(held);
        let _held = pool.acquire("b", &Value::Null).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_image.get("b"), Some(&1));
    }

    #[tokio::test]
    async fn test_init_failure_is_not_pooled() {
        let (pool, _counters) = pool(2);
        let err = pool
            .acquire("image", &serde_json::json!({"fail": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Provider(_)));
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_stop_all() {
        let (pool, counters) = pool(3);
        let held = pool.acquire("a", &Value::Null).await.unwrap();
        let idle = pool.acquire("b", &Value::Null).await.unwrap();
        drop(idle);

        pool.stop_all().await;
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats(), PoolStats { max_size: 3, ..Default::default() });

        // A lease outliving stop_all returns to nothing.
        drop(held);
        assert_eq!(pool.stats().total, 0);
    }
}
