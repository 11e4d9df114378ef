//! Memory Cache Module
//!
//! Thread-safe LRU cache enforcing count, cost, and age limits, with
//! deferred release of evicted values and a self-re-arming background
//! trim task.
//!
//! All state mutations happen under a single mutex. The mutex is never
//! held across a user-value destructor, I/O, or a caller hook: evictions
//! collect entries into a holder which is destroyed after the lock is
//! released, on the thread picked by the configured
//! [`ReleasePolicy`](crate::ReleasePolicy).

use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::debug;

use crate::config::{LifecycleHook, MemoryCacheConfig};
use crate::host::HostSignals;
use crate::memory::lru::{DrainedEntries, LruList, Node};
use crate::memory::release::Releaser;
use crate::memory::stats::{CacheStats, StatsCounters};

/// Pause between try-lock attempts in a trim loop, so long evictions
/// yield to readers.
const TRIM_RETRY_PAUSE: Duration = Duration::from_millis(10);

// == Holder ==
/// Evicted state carried out of the critical section for deferred
/// destruction.
enum Holder<K, V> {
    Nodes(Vec<Node<K, V>>),
    Values(Vec<V>),
    Bulk(DrainedEntries<K, V>),
}

// == Shared State ==
struct Shared<K, V> {
    name: String,
    count_limit: usize,
    cost_limit: u64,
    age_limit: Option<Duration>,
    remove_all_on_memory_pressure: bool,
    remove_all_on_background: bool,
    on_memory_pressure: Option<LifecycleHook>,
    on_did_enter_background: Option<LifecycleHook>,
    lru: Mutex<LruList<K, V>>,
    stats: StatsCounters,
    releaser: Releaser<Holder<K, V>>,
    runtime: Option<Handle>,
}

impl<K, V> Shared<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + 'static,
{
    // == Trim Loops ==
    //
    // The mutex is not held for the whole eviction: each try-lock
    // acquisition evicts a single tail entry into the holder and
    // releases the lock again. A failed acquisition sleeps briefly and
    // retries.

    fn trim_until<F>(&self, done: F) -> usize
    where
        F: Fn(&LruList<K, V>) -> bool,
    {
        let mut holder = Vec::new();
        loop {
            let evicted = match self.lru.try_lock() {
                Some(mut lru) => {
                    if done(&*lru) {
                        break;
                    }
                    lru.remove_tail()
                }
                None => {
                    std::thread::sleep(TRIM_RETRY_PAUSE);
                    continue;
                }
            };
            match evicted {
                Some(node) => holder.push(node),
                None => break,
            }
        }
        let evicted = holder.len();
        if evicted > 0 {
            self.stats.record_evictions(evicted as u64);
            self.releaser.release(Holder::Nodes(holder));
        }
        evicted
    }

    fn trim_to_cost(&self, limit: u64) {
        if limit == 0 {
            self.remove_all();
            return;
        }
        {
            let lru = self.lru.lock();
            if lru.total_cost() <= limit {
                return;
            }
        }
        let evicted = self.trim_until(|lru| lru.total_cost() <= limit);
        debug!(name = %self.name, evicted, limit, "cost trim");
    }

    fn trim_to_count(&self, limit: usize) {
        if limit == 0 {
            self.remove_all();
            return;
        }
        {
            let lru = self.lru.lock();
            if lru.total_count() <= limit {
                return;
            }
        }
        let evicted = self.trim_until(|lru| lru.total_count() <= limit);
        debug!(name = %self.name, evicted, limit, "count trim");
    }

    fn trim_to_age(&self, limit: Duration) {
        let now = Instant::now();
        {
            let lru = self.lru.lock();
            // Nothing to trim when the list is empty or the oldest
            // entry is still young enough.
            let within = lru
                .tail_node()
                .map_or(true, |tail| now.duration_since(tail.touched_at) <= limit);
            if within {
                return;
            }
        }
        let evicted = self.trim_until(|lru| {
            lru.tail_node()
                .map_or(true, |tail| now.duration_since(tail.touched_at) <= limit)
        });
        debug!(name = %self.name, evicted, ?limit, "age trim");
    }

    fn remove_all(&self) {
        let drained = {
            let mut lru = self.lru.lock();
            if lru.total_count() == 0 {
                return;
            }
            lru.take_all()
        };
        debug!(name = %self.name, "cleared");
        self.releaser.release(Holder::Bulk(drained));
    }

    // == Host Reactions ==

    fn apply_memory_pressure(&self) {
        if let Some(hook) = &self.on_memory_pressure {
            hook();
        }
        if self.remove_all_on_memory_pressure {
            self.remove_all();
        }
    }

    fn apply_did_enter_background(&self) {
        if let Some(hook) = &self.on_did_enter_background {
            hook();
        }
        if self.remove_all_on_background {
            self.remove_all();
        }
    }
}

// == Memory Cache ==
/// An in-process, thread-safe LRU cache with count, cost, and age
/// limits.
///
/// Cloning produces another handle to the same cache. Look-ups and
/// writes never fail; a full cache evicts from the least-recently-used
/// tail to make room. Values that cannot be cloned cheaply are best
/// stored as `Arc<V>`.
///
/// Background behavior (the periodic trim task and the release worker)
/// requires a tokio runtime to be current at construction; without one
/// the cache stays fully functional but performs trims and destructor
/// runs inline.
pub struct MemoryCache<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for MemoryCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> std::fmt::Debug for MemoryCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lru = self.shared.lru.lock();
        f.debug_struct("MemoryCache")
            .field("name", &self.shared.name)
            .field("total_count", &lru.total_count())
            .field("total_cost", &lru.total_cost())
            .finish()
    }
}

impl<K, V> MemoryCache<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + 'static,
{
    // == Constructor ==
    /// Creates a cache and, when a runtime is current, spawns its
    /// auto-trim task.
    pub fn new(config: MemoryCacheConfig) -> Self {
        let runtime = Handle::try_current().ok();
        let releaser = Releaser::new(config.release_policy, runtime.as_ref());
        let shared = Arc::new(Shared {
            name: config.name,
            count_limit: config.count_limit,
            cost_limit: config.cost_limit,
            age_limit: config.age_limit,
            remove_all_on_memory_pressure: config.remove_all_on_memory_pressure,
            remove_all_on_background: config.remove_all_on_background,
            on_memory_pressure: config.on_memory_pressure,
            on_did_enter_background: config.on_did_enter_background,
            lru: Mutex::new(LruList::new()),
            stats: StatsCounters::default(),
            releaser,
            runtime,
        });
        if let Some(handle) = shared.runtime.clone() {
            spawn_auto_trim(Arc::downgrade(&shared), config.auto_trim_interval, &handle);
        }
        Self { shared }
    }

    // == Contains ==
    /// Probes the key map under the lock.
    pub fn contains(&self, key: &K) -> bool {
        self.shared.lru.lock().contains(key)
    }

    // == Get ==
    /// Returns the value for `key`, refreshing its access time and
    /// promoting it to most-recently-used on a hit.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let value = {
            let mut lru = self.shared.lru.lock();
            match lru.index_of(key) {
                Some(idx) => {
                    lru.touch(idx);
                    lru.node(idx).map(|node| node.value.clone())
                }
                None => None,
            }
        };
        match value {
            Some(_) => self.shared.stats.record_hit(),
            None => self.shared.stats.record_miss(),
        }
        value
    }

    // == Set ==
    /// Inserts or overwrites the entry for `key` with the given cost,
    /// making it most-recently-used.
    ///
    /// An overwrite adjusts the cost sum by the delta between old and
    /// new cost. Exceeding the count limit synchronously evicts one
    /// tail entry; exceeding the cost limit schedules an asynchronous
    /// cost trim. Displaced values are destroyed off the critical path.
    pub fn set(&self, key: K, value: V, cost: u64) {
        let mut old_values = Vec::new();
        let mut evicted = Vec::new();
        let over_cost;
        {
            let mut lru = self.shared.lru.lock();
            match lru.index_of(&key) {
                Some(idx) => {
                    if let Some(old) = lru.update(idx, value, cost) {
                        old_values.push(old);
                    }
                    lru.bring_to_head(idx);
                }
                None => {
                    lru.insert_at_head(key, value, cost);
                }
            }
            over_cost = lru.total_cost() > self.shared.cost_limit;
            if lru.total_count() > self.shared.count_limit {
                if let Some(node) = lru.remove_tail() {
                    evicted.push(node);
                }
            }
        }
        if !old_values.is_empty() {
            self.shared.releaser.release(Holder::Values(old_values));
        }
        if !evicted.is_empty() {
            self.shared.stats.record_evictions(evicted.len() as u64);
            self.shared.releaser.release(Holder::Nodes(evicted));
        }
        if over_cost {
            self.schedule_cost_trim();
        }
    }

    // == Remove ==
    /// Removes the entry for `key`, if present; its destructor runs off
    /// the critical path.
    pub fn remove(&self, key: &K) {
        let node = {
            let mut lru = self.shared.lru.lock();
            lru.index_of(key).and_then(|idx| lru.remove(idx))
        };
        if let Some(node) = node {
            self.shared.releaser.release(Holder::Nodes(vec![node]));
        }
    }

    // == Remove All ==
    /// Clears the cache; destruction of the old entries is deferred to
    /// the release destination.
    pub fn remove_all(&self) {
        self.shared.remove_all();
    }

    // == Trims ==

    /// Evicts least-recently-used entries until at most `limit` remain.
    pub fn trim_to_count(&self, limit: usize) {
        self.shared.trim_to_count(limit);
    }

    /// Evicts least-recently-used entries until the cost sum is at most
    /// `limit`.
    pub fn trim_to_cost(&self, limit: u64) {
        self.shared.trim_to_cost(limit);
    }

    /// Evicts entries whose last access is older than `max_age`.
    pub fn trim_to_age(&self, max_age: Duration) {
        self.shared.trim_to_age(max_age);
    }

    // == Accessors ==

    pub fn total_count(&self) -> usize {
        self.shared.lru.lock().total_count()
    }

    pub fn total_cost(&self) -> u64 {
        self.shared.lru.lock().total_cost()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// A point-in-time snapshot of the performance counters and sizes.
    pub fn stats(&self) -> CacheStats {
        let (count, cost) = {
            let lru = self.shared.lru.lock();
            (lru.total_count(), lru.total_cost())
        };
        self.shared.stats.snapshot(count, cost)
    }

    // == Host Integration ==

    /// Direct delivery of a host low-memory signal: runs the configured
    /// hook, then clears the cache if so configured.
    pub fn handle_memory_pressure(&self) {
        self.shared.apply_memory_pressure();
    }

    /// Direct delivery of a host background transition.
    pub fn handle_did_enter_background(&self) {
        self.shared.apply_did_enter_background();
    }

    /// Subscribes this cache to a [`HostSignals`] hub.
    ///
    /// The listener holds only a weak back-reference and exits once the
    /// cache is gone. Without a current runtime this is a no-op; direct
    /// delivery through the `handle_*` methods still works.
    pub fn attach_host_signals(&self, signals: &HostSignals) {
        let Some(handle) = self.shared.runtime.clone() else {
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        let mut pressure = signals.subscribe_memory_pressure();
        let mut background = signals.subscribe_did_enter_background();
        handle.spawn(async move {
            use tokio::sync::broadcast::error::RecvError;
            loop {
                let to_background = tokio::select! {
                    received = pressure.recv() => match received {
                        Ok(()) => false,
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                    received = background.recv() => match received {
                        Ok(()) => true,
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                };
                let Some(shared) = weak.upgrade() else { break };
                let done = tokio::task::spawn_blocking(move || {
                    if to_background {
                        shared.apply_did_enter_background();
                    } else {
                        shared.apply_memory_pressure();
                    }
                })
                .await;
                if done.is_err() {
                    break;
                }
            }
        });
    }

    // == Internals ==

    fn schedule_cost_trim(&self) {
        let limit = self.shared.cost_limit;
        match &self.shared.runtime {
            Some(handle) => {
                let shared = Arc::clone(&self.shared);
                handle.spawn_blocking(move || shared.trim_to_cost(limit));
            }
            None => self.shared.trim_to_cost(limit),
        }
    }
}

// == Auto Trim Task ==
/// Spawns the periodic low-priority trim: cost, count, then age. The
/// task holds a weak back-reference and exits once the cache is gone.
fn spawn_auto_trim<K, V>(weak: Weak<Shared<K, V>>, interval: Duration, handle: &Handle)
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + 'static,
{
    handle.spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(shared) = weak.upgrade() else { break };
            let done = tokio::task::spawn_blocking(move || {
                shared.trim_to_cost(shared.cost_limit);
                shared.trim_to_count(shared.count_limit);
                if let Some(age) = shared.age_limit {
                    shared.trim_to_age(age);
                }
                let (count, cost) = {
                    let lru = shared.lru.lock();
                    (lru.total_count(), lru.total_cost())
                };
                let stats = shared.stats.snapshot(count, cost);
                debug!(
                    name = %shared.name,
                    total_count = stats.total_count,
                    total_cost = stats.total_cost,
                    hits = stats.hits,
                    misses = stats.misses,
                    evictions = stats.evictions,
                    "auto trim pass"
                );
            })
            .await;
            if done.is_err() {
                break;
            }
        }
    });
}
