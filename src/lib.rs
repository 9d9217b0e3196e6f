//! fleetcache: a concurrent in-process key/value cache with per-entry TTL.
//!
//! Two layers:
//!
//! * [`StripedMap`]: a flat concurrent hash map with seven-slot cache-line
//!   buckets, per-bucket optimistic snapshot reads validated by a sequence
//!   word, root-bucket locks for writers, and cooperative chunked growth.
//! * [`Cache`]: per-entry expiry on top of the map, with an atomic default
//!   TTL, an eviction callback fired outside the locks, and a background
//!   sweeper thread.
//!
//! ```
//! use std::time::Duration;
//! use fleetcache::{Cache, Ttl, DEFAULT_EXPIRATION, NO_EXPIRATION};
//!
//! let cache: Cache<String, u64> = Cache::builder()
//!     .default_ttl(Ttl::from_secs(60))
//!     .cleanup_interval(Duration::from_secs(10))
//!     .build();
//!
//! cache.set("session".to_owned(), 1, DEFAULT_EXPIRATION);
//! cache.set("config".to_owned(), 2, NO_EXPIRATION);
//! assert_eq!(cache.get(&"session".to_owned()), Some(1));
//! ```
//!
//! The closures handed to [`Cache::compute`], [`Cache::get_or_compute`] and
//! [`StripedMap::compute`] run **under a bucket lock**. That is what makes
//! them single-flight and atomic with the expiry recheck, and it is also
//! why they must not block or reenter the cache.

mod cache;
mod config;
mod hash;
mod item;
mod map;
mod ttl;

pub use cache::{Cache, EvictedCallback};
pub use config::{CacheBuilder, DEFAULT_CLEANUP_INTERVAL, DEFAULT_MIN_CAPACITY};
pub use hash::{mix64, IntMixHasher, IntMixState};
pub use item::ExpiringEntry;
pub use map::{Iter, Op, StripedMap, SLOTS_PER_BUCKET};
pub use ttl::{Ttl, DEFAULT_EXPIRATION, NO_EXPIRATION};
