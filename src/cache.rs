//! The TTL cache façade: per-entry expiry over [`StripedMap`], an atomic
//! default-TTL/callback pair, and the background expiry sweeper.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, SystemTime};

use ahash::RandomState;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use tracing::debug;

use crate::config::CacheBuilder;
use crate::config::Config;
use crate::item::{now_unix_nanos, unix_nanos, ExpiringEntry, Item};
use crate::map::{Op, StripedMap};
use crate::ttl::{Ttl, DEFAULT_EXPIRATION, NO_EXPIRATION};

/// Invoked once per evicted `(key, value)` pair, outside any bucket lock.
/// Must not block; anything slow belongs on the callback's own executor.
pub type EvictedCallback<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

/// A concurrent in-process cache with per-entry time-to-live.
///
/// Entries are stored in a [`StripedMap`] as `{value, absolute expiry}`
/// records. Every read treats an expired entry as absent and removes it in
/// the same bucket-locked step as the recheck, so a concurrent refresh is
/// never lost. A background sweeper (when enabled) periodically removes
/// whatever expired entries reads have not touched.
///
/// The handle is not `Clone`; share it as `Arc<Cache<..>>`. Dropping the
/// handle closes the cache, which stops the sweeper but leaves the data
/// readable through any outstanding references.
pub struct Cache<K, V, S = RandomState> {
    core: Arc<CacheCore<K, V, S>>,
}

struct CacheCore<K, V, S> {
    items: StripedMap<K, Item<V>, S>,
    default_ttl_ns: AtomicI64,
    evicted: CallbackCell<K, V>,
    stop: Mutex<Option<Sender<()>>>,
    closed: AtomicBool,
}

impl<K, V, S> CacheCore<K, V, S> {
    /// Idempotent: the first call drops the stop sender, which wakes the
    /// sweeper; later calls are no-ops.
    fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.stop.lock().unwrap().take();
            debug!("cache closed");
        }
    }
}

impl<K, V, S> Drop for Cache<K, V, S> {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl<K, V> Cache<K, V, RandomState>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// A cache with no default expiry and the default sweeper interval.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// A cache with the given default TTL and sweeper interval. A zero
    /// interval disables the sweeper.
    pub fn with_defaults(default_ttl: Ttl, cleanup_interval: Duration) -> Self {
        Self::builder()
            .default_ttl(default_ttl)
            .cleanup_interval(cleanup_interval)
            .build()
    }

    pub fn builder() -> CacheBuilder<K, V> {
        CacheBuilder::new()
    }
}

impl<K, V> Default for Cache<K, V, RandomState>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    pub(crate) fn from_config(config: Config<K, V>, hasher: S) -> Self {
        let core = Arc::new(CacheCore {
            items: StripedMap::with_capacity_and_hasher(config.min_capacity, hasher),
            default_ttl_ns: AtomicI64::new(config.default_ttl.as_nanos()),
            evicted: CallbackCell::new(config.evicted),
            stop: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if config.cleanup_interval > Duration::ZERO {
            let (stop_tx, stop_rx) = bounded::<()>(0);
            *core.stop.lock().unwrap() = Some(stop_tx);
            let sweeper_core = Arc::downgrade(&core);
            let interval = config.cleanup_interval;
            thread::Builder::new()
                .name("fleetcache-sweeper".into())
                .spawn(move || sweep_loop(sweeper_core, interval, stop_rx))
                .expect("spawning the sweeper thread failed");
        }

        Self { core }
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    /// Insert `value` under `key` with the given TTL, replacing any
    /// existing entry. [`DEFAULT_EXPIRATION`] applies the cache default;
    /// [`NO_EXPIRATION`] and every other non-positive TTL mean the entry
    /// never expires.
    pub fn set(&self, key: K, value: V, ttl: Ttl) {
        let expires_at_ns = self.core.resolve_expiry(ttl);
        self.core.items.store(key, Item { value, expires_at_ns });
    }

    /// Insert with the cache's default expiration.
    pub fn set_default(&self, key: K, value: V) {
        self.set(key, value, DEFAULT_EXPIRATION);
    }

    /// Insert a never-expiring entry.
    pub fn set_forever(&self, key: K, value: V) {
        self.set(key, value, NO_EXPIRATION);
    }

    /// Look up a fresh value. An expired entry is treated as absent and
    /// removed on the way out.
    pub fn get(&self, key: &K) -> Option<V> {
        self.core.get_item(key).map(|item| item.value)
    }

    /// Like [`get`](Self::get), also reporting when the entry expires;
    /// `None` for a never-expiring entry.
    pub fn get_with_expiration(&self, key: &K) -> Option<(V, Option<SystemTime>)> {
        let item = self.core.get_item(key)?;
        let at = item.expires_at();
        Some((item.value, at))
    }

    /// Like [`get`](Self::get), also reporting the remaining lifetime;
    /// [`NO_EXPIRATION`] for a never-expiring entry.
    pub fn get_with_ttl(&self, key: &K) -> Option<(V, Ttl)> {
        let item = self.core.get_item(key)?;
        let remaining = if item.expires_at_ns > 0 {
            Ttl::from_nanos(item.expires_at_ns - now_unix_nanos())
        } else {
            NO_EXPIRATION
        };
        Some((item.value, remaining))
    }

    /// Return the existing fresh value (`loaded = true`), or insert
    /// `value` with `ttl` and return it (`loaded = false`). One atomic
    /// step: the freshness check and the insert share the bucket lock.
    pub fn get_or_set(&self, key: K, value: V, ttl: Ttl) -> (V, bool) {
        let mut loaded = false;
        let (_, current) = self.core.items.compute(key, |cur| match cur {
            Some(item) if !item.expired() => {
                loaded = true;
                (Op::Cancel, None)
            }
            _ => (
                Op::Update,
                Some(Item {
                    value: value.clone(),
                    expires_at_ns: self.core.resolve_expiry(ttl),
                }),
            ),
        });
        match current {
            Some(item) => (item.value, loaded),
            None => (value, loaded),
        }
    }

    /// Store `value` unconditionally. Returns the prior fresh value with
    /// `loaded = true` when there was one; otherwise returns the **newly
    /// stored** value with `loaded = false` (the key may still have held an
    /// expired leftover; `loaded` reports prior freshness, not presence).
    pub fn get_and_set(&self, key: K, value: V, ttl: Ttl) -> (V, bool) {
        let mut prior: Option<V> = None;
        let (_, current) = self.core.items.compute(key, |cur| {
            if let Some(item) = cur {
                if !item.expired() {
                    prior = Some(item.value.clone());
                }
            }
            (
                Op::Update,
                Some(Item {
                    value: value.clone(),
                    expires_at_ns: self.core.resolve_expiry(ttl),
                }),
            )
        });
        match prior {
            Some(p) => (p, true),
            None => match current {
                Some(item) => (item.value, false),
                None => (value, false),
            },
        }
    }

    /// Return the fresh value while resetting its expiry to `ttl`. An
    /// absent or expired key yields `None` (the expired leftover is
    /// removed).
    pub fn get_and_refresh(&self, key: &K, ttl: Ttl) -> Option<V> {
        let (_, current) = self.core.items.compute(key.clone(), |cur| match cur {
            Some(item) if !item.expired() => (
                Op::Update,
                Some(Item {
                    value: item.value.clone(),
                    expires_at_ns: self.core.resolve_expiry(ttl),
                }),
            ),
            _ => (Op::Delete, None),
        });
        current.map(|item| item.value)
    }

    /// Return the existing fresh value (`loaded = true`) or produce one
    /// with `value_fn`. `value_fn` returning `None` cancels the insert and
    /// the cache is left untouched.
    ///
    /// `value_fn` runs **under the bucket lock**, which is what makes the
    /// computation single-flight for a contended key. It must not block
    /// and must not touch this cache: a lookup from inside it deadlocks.
    pub fn get_or_compute<F>(&self, key: K, value_fn: F, ttl: Ttl) -> (Option<V>, bool)
    where
        F: FnOnce() -> Option<V>,
    {
        if let Some(item) = self.core.items.load(&key) {
            if !item.expired() {
                return (Some(item.value), true);
            }
        }
        let mut loaded = false;
        let mut value_fn = Some(value_fn);
        let (_, current) = self.core.items.compute(key, |cur| match cur {
            Some(item) if !item.expired() => {
                loaded = true;
                (Op::Cancel, None)
            }
            _ => match value_fn.take().unwrap()() {
                Some(value) => (
                    Op::Update,
                    Some(Item {
                        value,
                        expires_at_ns: self.core.resolve_expiry(ttl),
                    }),
                ),
                None => (Op::Cancel, None),
            },
        });
        match current {
            Some(item) if !item.expired() => (Some(item.value), loaded),
            _ => (None, false),
        }
    }

    /// Atomic read-modify-write. `op_fn` receives the current fresh value
    /// (`None` when absent or expired) and decides: `Update` stores its
    /// value with `ttl`, `Delete` removes any mapping, `Cancel` changes
    /// nothing. Returns the value present after the operation and whether
    /// one is present; on `Delete` the removed fresh value comes back with
    /// `false` and the evicted callback fires once the lock is released.
    ///
    /// `op_fn` runs **under the bucket lock**; the same rules as
    /// [`get_or_compute`](Self::get_or_compute) apply.
    pub fn compute<F>(&self, key: K, mut op_fn: F, ttl: Ttl) -> (Option<V>, bool)
    where
        F: FnMut(Option<&V>) -> (Op, Option<V>),
    {
        let mut old: Option<V> = None;
        let mut deleted = false;
        let (_, current) = self.core.items.compute(key.clone(), |cur| {
            let fresh = cur.filter(|item| !item.expired());
            if let Some(item) = fresh {
                old = Some(item.value.clone());
            }
            match op_fn(fresh.map(|item| &item.value)) {
                (Op::Update, Some(value)) => (
                    Op::Update,
                    Some(Item {
                        value,
                        expires_at_ns: self.core.resolve_expiry(ttl),
                    }),
                ),
                (Op::Delete, _) => {
                    deleted = true;
                    (Op::Delete, None)
                }
                _ => (Op::Cancel, None),
            }
        });
        if deleted {
            if let Some(removed) = &old {
                if let Some(callback) = self.core.evicted.snapshot() {
                    callback(&key, removed);
                }
            }
        }
        match current {
            Some(item) if !item.expired() => (Some(item.value), true),
            _ => (old, false),
        }
    }

    /// Remove `key`, invoking the evicted callback if an entry was
    /// present.
    pub fn delete(&self, key: &K) {
        self.get_and_delete(key);
    }

    /// Remove `key` and return its value. The evicted callback runs after
    /// the bucket lock is released.
    pub fn get_and_delete(&self, key: &K) -> Option<V> {
        let item = self.core.items.load_and_delete(key)?;
        if let Some(callback) = self.core.evicted.snapshot() {
            callback(key, &item.value);
        }
        Some(item.value)
    }

    /// Remove every entry that has expired by now. Each removal rechecks
    /// the entry under its bucket lock, so a concurrent refresh survives;
    /// callbacks fire once per removed pair, after the iteration.
    pub fn delete_expired(&self) {
        self.core.delete_expired();
    }

    /// Visit fresh entries until `f` returns `false`. Expiry is judged
    /// against a single timestamp captured at the start. Not a snapshot:
    /// concurrent mutation may or may not be visible, and mutating the
    /// cache from inside `f`, including deleting the visited key, is
    /// allowed.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let now = now_unix_nanos();
        self.core.items.range(|k, item| {
            if item.expired_at(now) {
                true
            } else {
                f(k, &item.value)
            }
        });
    }

    /// Clone the fresh entries into a plain map.
    pub fn items(&self) -> HashMap<K, V> {
        let mut out = HashMap::with_capacity(self.count());
        self.range(|k, v| {
            out.insert(k.clone(), v.clone());
            true
        });
        out
    }

    /// Clone the fresh entries with their absolute expiry instants,
    /// suitable for persisting and reloading through
    /// [`load_items_with_expiration`](Self::load_items_with_expiration).
    pub fn items_with_expiration(&self) -> HashMap<K, ExpiringEntry<V>> {
        let now = now_unix_nanos();
        let mut out = HashMap::with_capacity(self.count());
        self.core.items.range(|k, item| {
            if !item.expired_at(now) {
                out.insert(
                    k.clone(),
                    ExpiringEntry {
                        value: item.value.clone(),
                        expires_at: item.expires_at(),
                    },
                );
            }
            true
        });
        out
    }

    /// Store every pair with the same TTL. An empty input is a no-op.
    /// Note the TTL follows [`set`](Self::set) rules, so a non-sentinel
    /// `ttl <= 0` stores never-expiring entries.
    pub fn load_items<I>(&self, entries: I, ttl: Ttl)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in entries {
            self.set(key, value, ttl);
        }
    }

    /// Store entries carrying their own absolute expiry. `expires_at:
    /// None` stores forever; a future instant is kept as-is; a **past**
    /// instant is not admitted and additionally removes any existing entry
    /// at that key, without invoking the evicted callback (nothing was
    /// ever evicted; the record simply never got in). This is
    /// deliberately stricter than [`load_items`](Self::load_items) with a
    /// negative TTL, which stores forever.
    pub fn load_items_with_expiration<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, ExpiringEntry<V>)>,
    {
        let now = now_unix_nanos();
        for (key, entry) in entries {
            match entry.expires_at {
                None => self.core.items.store(
                    key,
                    Item {
                        value: entry.value,
                        expires_at_ns: 0,
                    },
                ),
                Some(at) => {
                    let at_ns = unix_nanos(at);
                    if at_ns > now {
                        self.core.items.store(
                            key,
                            Item {
                                value: entry.value,
                                expires_at_ns: at_ns,
                            },
                        );
                    } else {
                        self.core.items.load_and_delete(&key);
                    }
                }
            }
        }
    }

    /// Number of stored entries, including expired ones the sweeper has
    /// not reaped yet.
    pub fn count(&self) -> usize {
        self.core.items.len()
    }

    /// Remove all entries without invoking the evicted callback.
    pub fn clear(&self) {
        self.core.items.clear();
    }

    /// Stop the background sweeper. Idempotent; the cache itself remains
    /// fully usable, and [`Drop`] calls this automatically.
    pub fn close(&self) {
        self.core.close();
    }

    /// The TTL substituted for [`DEFAULT_EXPIRATION`] writes.
    pub fn default_expiration(&self) -> Ttl {
        Ttl::from_nanos(self.core.default_ttl_ns.load(Ordering::Acquire))
    }

    /// Replace the default TTL. Takes effect for subsequent writes.
    pub fn set_default_expiration(&self, ttl: Ttl) {
        self.core.default_ttl_ns.store(ttl.as_nanos(), Ordering::Release);
    }

    /// The currently installed evicted callback, if any.
    pub fn evicted_callback(&self) -> Option<EvictedCallback<K, V>> {
        self.core.evicted.snapshot()
    }

    /// Install (or with `None`, remove) the evicted callback. Takes effect
    /// for subsequent evictions.
    pub fn set_evicted_callback(&self, callback: Option<EvictedCallback<K, V>>) {
        self.core.evicted.replace(callback);
    }
}

impl<K, V, S> CacheCore<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    /// Translate a per-write TTL into an absolute expiry, consulting the
    /// default-TTL cell for the sentinel.
    fn resolve_expiry(&self, ttl: Ttl) -> i64 {
        let mut nanos = ttl.as_nanos();
        if ttl == DEFAULT_EXPIRATION {
            nanos = self.default_ttl_ns.load(Ordering::Acquire);
        }
        if nanos > 0 {
            now_unix_nanos() + nanos
        } else {
            0
        }
    }

    /// Fresh-entry lookup. The expired path rechecks under the bucket
    /// lock: deletion happens only if the entry is still expired there, so
    /// a write that raced in between is returned instead of lost.
    fn get_item(&self, key: &K) -> Option<Item<V>> {
        let item = self.items.load(key)?;
        if !item.expired() {
            return Some(item);
        }
        let (_, current) = self.items.compute(key.clone(), |cur| match cur {
            Some(item) if !item.expired() => (Op::Cancel, None),
            _ => (Op::Delete, None),
        });
        current
    }

    fn delete_expired(&self) {
        let now = now_unix_nanos();
        let callback = self.evicted.snapshot();
        let mut evicted: Vec<(K, V)> = Vec::new();
        self.items.range_compute(|k, item| {
            if item.expired_at(now) {
                if callback.is_some() {
                    evicted.push((k.clone(), item.value.clone()));
                }
                (Op::Delete, None)
            } else {
                (Op::Cancel, None)
            }
        });
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "expired entries removed");
        }
        if let Some(callback) = callback {
            for (k, v) in &evicted {
                callback(k, v);
            }
        }
    }
}

/// Body of the sweeper thread. Holding only a `Weak` lets an abandoned
/// cache shut its sweeper down even when nobody called `close`.
fn sweep_loop<K, V, S>(core: Weak<CacheCore<K, V, S>>, interval: Duration, stop: Receiver<()>)
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    debug!(?interval, "expiry sweeper started");
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {
                match core.upgrade() {
                    Some(core) => core.delete_expired(),
                    None => break,
                }
            }
            recv(stop) -> _ => break,
        }
    }
    debug!("expiry sweeper stopped");
}

/// Lock-free-readable cell holding the optional evicted callback.
///
/// The callback lives in a leaked `Box`; readers load the pointer and
/// clone the `Arc` behind it. Replacement swaps the pointer and parks the
/// old box until the cell drops, so a reader can never race a free.
/// Replacements are rare and the parked boxes are two words each.
struct CallbackCell<K, V> {
    current: AtomicPtr<EvictedCallback<K, V>>,
    parked: Mutex<Vec<Box<EvictedCallback<K, V>>>>,
}

impl<K, V> CallbackCell<K, V> {
    fn new(callback: Option<EvictedCallback<K, V>>) -> Self {
        Self {
            current: AtomicPtr::new(Self::into_ptr(callback)),
            parked: Mutex::new(Vec::new()),
        }
    }

    fn into_ptr(callback: Option<EvictedCallback<K, V>>) -> *mut EvictedCallback<K, V> {
        match callback {
            Some(cb) => Box::into_raw(Box::new(cb)),
            None => std::ptr::null_mut(),
        }
    }

    fn snapshot(&self) -> Option<EvictedCallback<K, V>> {
        let p = self.current.load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            Some(unsafe { (*p).clone() })
        }
    }

    fn replace(&self, callback: Option<EvictedCallback<K, V>>) {
        let old = self
            .current
            .swap(Self::into_ptr(callback), Ordering::AcqRel);
        if !old.is_null() {
            self.parked.lock().unwrap().push(unsafe { Box::from_raw(old) });
        }
    }
}

impl<K, V> Drop for CallbackCell<K, V> {
    fn drop(&mut self) {
        let p = *self.current.get_mut();
        if !p.is_null() {
            drop(unsafe { Box::from_raw(p) });
        }
    }
}
