//! LRU cache of in-memory workflow executors.
//!
//! A cache hit lets the next task for an instance skip cold replay: the
//! executor keeps its advanced workflow future and only consumes the new
//! events. The cache is strictly an optimization — the backend history is
//! the source of truth, and any entry may be dropped at any time, forcing a
//! cold replay on the next task.

use super::execution::WorkflowExecutor;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 128;
const DEFAULT_TTL: Duration = Duration::from_secs(30);
const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration for [`ExecutorCache`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Maximum number of cached executors; least recently used entries are
    /// evicted beyond this.
    pub capacity: usize,
    /// Entries idle longer than this are evicted by the eviction task.
    pub ttl: Duration,
    /// How often the eviction task scans for idle entries.
    pub eviction_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            ttl: DEFAULT_TTL,
            eviction_interval: DEFAULT_EVICTION_INTERVAL,
        }
    }
}

struct CacheEntry {
    executor: Arc<Mutex<WorkflowExecutor>>,
    last_access: Instant,
}

/// Maps `instance_id` to its cached executor with LRU and idle-TTL
/// eviction.
pub struct ExecutorCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
    eviction_interval: Duration,
}

impl ExecutorCache {
    pub fn new(options: CacheOptions) -> Self {
        let capacity = NonZeroUsize::new(options.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: options.ttl,
            eviction_interval: options.eviction_interval,
        }
    }

    /// Returns the cached executor for an instance, refreshing its access
    /// time.
    pub fn get(&self, instance_id: &str) -> Option<Arc<Mutex<WorkflowExecutor>>> {
        let mut entries = self.entries.lock().unwrap();
        entries.get_mut(instance_id).map(|entry| {
            entry.last_access = Instant::now();
            entry.executor.clone()
        })
    }

    /// Stores (or refreshes) the executor for an instance.
    pub fn store(&self, instance_id: impl Into<String>, executor: Arc<Mutex<WorkflowExecutor>>) {
        let mut entries = self.entries.lock().unwrap();
        entries.put(
            instance_id.into(),
            CacheEntry {
                executor,
                last_access: Instant::now(),
            },
        );
    }

    pub fn remove(&self, instance_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.pop(instance_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_idle(&self) {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let ttl = self.ttl;
        let idle: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_access) > ttl)
            .map(|(instance_id, _)| instance_id.clone())
            .collect();
        for instance_id in idle {
            debug!(instance_id = %instance_id, "evicting idle executor");
            entries.pop(&instance_id);
        }
    }

    /// Starts the eviction task; it runs until the token is cancelled.
    pub fn start_eviction(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.eviction_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => cache.evict_idle(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SystemClock, WorkflowInstance};
    use crate::executor::Registry;
    use std::sync::RwLock;

    fn executor(instance_id: &str) -> Arc<Mutex<WorkflowExecutor>> {
        let instance = WorkflowInstance::new(instance_id, "e-1");
        Arc::new(Mutex::new(WorkflowExecutor::new(
            instance,
            Arc::new(RwLock::new(Registry::new())),
            Arc::new(SystemClock),
            vec![],
        )))
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let cache = ExecutorCache::new(CacheOptions {
            capacity: 2,
            ..CacheOptions::default()
        });

        cache.store("a", executor("a"));
        cache.store("b", executor("b"));
        cache.store("c", executor("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[tokio::test]
    async fn test_idle_entries_evicted() {
        let cache = ExecutorCache::new(CacheOptions {
            capacity: 8,
            ttl: Duration::from_millis(0),
            ..CacheOptions::default()
        });

        cache.store("a", executor("a"));
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.evict_idle();
        assert!(cache.is_empty());
    }
}
