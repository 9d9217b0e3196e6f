//! Cache construction: defaults and the builder.

use std::hash::BuildHasher;
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;

use crate::cache::{Cache, EvictedCallback};
use crate::ttl::{Ttl, NO_EXPIRATION};

/// How often the sweeper runs when not configured otherwise.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Smallest initial capacity hint a cache is created with.
pub const DEFAULT_MIN_CAPACITY: usize = 96;

/// Resolved construction parameters.
pub(crate) struct Config<K, V> {
    pub default_ttl: Ttl,
    pub cleanup_interval: Duration,
    pub evicted: Option<EvictedCallback<K, V>>,
    pub min_capacity: usize,
}

impl<K, V> Config<K, V> {
    /// Clamp out-of-range settings the way the defaults are defined: a
    /// non-positive default TTL collapses to never-expire, the capacity
    /// hint never drops below [`DEFAULT_MIN_CAPACITY`].
    pub(crate) fn normalized(mut self) -> Self {
        if self.default_ttl.as_nanos() < 1 {
            self.default_ttl = NO_EXPIRATION;
        }
        if self.min_capacity < DEFAULT_MIN_CAPACITY {
            self.min_capacity = DEFAULT_MIN_CAPACITY;
        }
        self
    }
}

/// Configures and builds a [`Cache`].
///
/// ```
/// use std::time::Duration;
/// use fleetcache::{Cache, Ttl};
///
/// let cache: Cache<String, u64> = Cache::builder()
///     .default_ttl(Ttl::from_secs(300))
///     .cleanup_interval(Duration::from_secs(30))
///     .build();
/// cache.set_default("answer".to_owned(), 42);
/// ```
pub struct CacheBuilder<K, V, S = RandomState> {
    default_ttl: Ttl,
    cleanup_interval: Duration,
    evicted: Option<EvictedCallback<K, V>>,
    min_capacity: usize,
    hasher: S,
}

impl<K, V> CacheBuilder<K, V, RandomState> {
    pub(crate) fn new() -> Self {
        Self {
            default_ttl: NO_EXPIRATION,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            evicted: None,
            min_capacity: DEFAULT_MIN_CAPACITY,
            hasher: RandomState::new(),
        }
    }
}

impl<K, V, S> CacheBuilder<K, V, S> {
    /// TTL applied to writes carrying [`DEFAULT_EXPIRATION`](crate::DEFAULT_EXPIRATION).
    pub fn default_ttl(mut self, ttl: Ttl) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Period of the background expiry sweep. `Duration::ZERO` disables the
    /// sweeper; expired entries are then reaped by reads or by explicit
    /// [`Cache::delete_expired`] calls.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Callback invoked once per evicted `(key, value)` pair, always
    /// outside any bucket lock.
    pub fn evicted_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        self.evicted = Some(Arc::new(callback));
        self
    }

    /// Pre-size the table for at least this many entries.
    pub fn min_capacity(mut self, capacity: usize) -> Self {
        self.min_capacity = capacity;
        self
    }

    /// Use a custom [`BuildHasher`] for key placement (for example
    /// [`IntMixState`](crate::IntMixState) for integer keys).
    pub fn hasher<S2: BuildHasher>(self, hasher: S2) -> CacheBuilder<K, V, S2> {
        CacheBuilder {
            default_ttl: self.default_ttl,
            cleanup_interval: self.cleanup_interval,
            evicted: self.evicted,
            min_capacity: self.min_capacity,
            hasher,
        }
    }

    pub fn build(self) -> Cache<K, V, S>
    where
        K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        S: BuildHasher + Send + Sync + 'static,
    {
        let config = Config {
            default_ttl: self.default_ttl,
            cleanup_interval: self.cleanup_interval,
            evicted: self.evicted,
            min_capacity: self.min_capacity,
        }
        .normalized();
        Cache::from_config(config, self.hasher)
    }
}
