//! The stored record: a value plus its absolute expiry instant.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Wall-clock Unix time in nanoseconds.
#[inline]
pub(crate) fn now_unix_nanos() -> i64 {
    unix_nanos(SystemTime::now())
}

#[inline]
pub(crate) fn unix_nanos(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(_) => 0,
    }
}

/// A cached value with its expiry. `expires_at_ns == 0` means the entry
/// never expires.
#[derive(Clone, Debug)]
pub(crate) struct Item<V> {
    pub value: V,
    pub expires_at_ns: i64,
}

impl<V> Item<V> {
    #[inline]
    pub fn expired(&self) -> bool {
        self.expired_at(now_unix_nanos())
    }

    #[inline]
    pub fn expired_at(&self, now_ns: i64) -> bool {
        self.expires_at_ns > 0 && now_ns > self.expires_at_ns
    }

    /// The absolute expiry instant, `None` for never-expiring entries.
    pub fn expires_at(&self) -> Option<SystemTime> {
        if self.expires_at_ns > 0 {
            Some(UNIX_EPOCH + Duration::from_nanos(self.expires_at_ns as u64))
        } else {
            None
        }
    }
}

/// The record exchanged by the bulk snapshot and load operations.
/// `expires_at: None` means the entry never expires. Serialization of these
/// records (JSON or otherwise) is the caller's business.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExpiringEntry<V> {
    pub value: V,
    pub expires_at: Option<SystemTime>,
}
