//! Configuration Module
//!
//! Construction-time options for the in-memory cache. All configuration
//! enters through these structs; there are no environment variables and
//! no configuration files.

use std::sync::Arc;
use std::time::Duration;

use crate::memory::ReleasePolicy;

/// Caller hook invoked on a host lifecycle signal, before the cache
/// reacts to it.
pub type LifecycleHook = Arc<dyn Fn() + Send + Sync>;

/// Default period of the background trim task.
pub const DEFAULT_AUTO_TRIM_INTERVAL: Duration = Duration::from_secs(5);

// == Memory Cache Config ==
/// Options for [`MemoryCache`](crate::MemoryCache).
///
/// Every field has a default; construct with struct-update syntax:
///
/// ```
/// use tiercache::MemoryCacheConfig;
///
/// let config = MemoryCacheConfig {
///     name: "thumbnails".to_string(),
///     count_limit: 1024,
///     ..Default::default()
/// };
/// ```
#[derive(Clone)]
pub struct MemoryCacheConfig {
    /// Diagnostic name, included in log output.
    pub name: String,
    /// Maximum number of entries; excess is evicted from the tail.
    /// Unbounded by default.
    pub count_limit: usize,
    /// Maximum sum of entry costs; excess is evicted from the tail.
    /// Unbounded by default.
    pub cost_limit: u64,
    /// Maximum entry age before the background trim evicts it.
    /// Unbounded by default.
    pub age_limit: Option<Duration>,
    /// Period of the background trim task.
    pub auto_trim_interval: Duration,
    /// Where destructors of evicted values run.
    pub release_policy: ReleasePolicy,
    /// Clear the cache when the host reports memory pressure.
    pub remove_all_on_memory_pressure: bool,
    /// Clear the cache when the host moves to the background.
    pub remove_all_on_background: bool,
    /// Invoked before the memory-pressure clear.
    pub on_memory_pressure: Option<LifecycleHook>,
    /// Invoked before the background-transition clear.
    pub on_did_enter_background: Option<LifecycleHook>,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            name: "memory-cache".to_string(),
            count_limit: usize::MAX,
            cost_limit: u64::MAX,
            age_limit: None,
            auto_trim_interval: DEFAULT_AUTO_TRIM_INTERVAL,
            release_policy: ReleasePolicy::default(),
            remove_all_on_memory_pressure: true,
            remove_all_on_background: true,
            on_memory_pressure: None,
            on_did_enter_background: None,
        }
    }
}

impl std::fmt::Debug for MemoryCacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCacheConfig")
            .field("name", &self.name)
            .field("count_limit", &self.count_limit)
            .field("cost_limit", &self.cost_limit)
            .field("age_limit", &self.age_limit)
            .field("auto_trim_interval", &self.auto_trim_interval)
            .field("release_policy", &self.release_policy)
            .field(
                "remove_all_on_memory_pressure",
                &self.remove_all_on_memory_pressure,
            )
            .field("remove_all_on_background", &self.remove_all_on_background)
            .field("on_memory_pressure", &self.on_memory_pressure.is_some())
            .field(
                "on_did_enter_background",
                &self.on_did_enter_background.is_some(),
            )
            .finish()
    }
}
