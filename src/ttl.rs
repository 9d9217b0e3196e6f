//! Time-to-live values and their sentinels.

use std::time::Duration;

/// A per-write time-to-live, in signed nanoseconds.
///
/// Two negative values are **sentinels**, recognized by equality rather than
/// magnitude: [`DEFAULT_EXPIRATION`] substitutes the cache-wide default and
/// [`NO_EXPIRATION`] disables expiry. Any other value `<= 0` also means
/// never-expire.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Ttl(i64);

/// Sentinel: the entry never expires.
pub const NO_EXPIRATION: Ttl = Ttl(-2_000_000_000);

/// Sentinel: use the cache's current default expiration.
pub const DEFAULT_EXPIRATION: Ttl = Ttl(-1_000_000_000);

impl Ttl {
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros * 1_000)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// The positive remaining time as a `Duration`; `None` for sentinels
    /// and other non-positive values.
    pub fn as_duration(self) -> Option<Duration> {
        u64::try_from(self.0).ok().map(Duration::from_nanos)
    }
}

impl From<Duration> for Ttl {
    fn from(d: Duration) -> Self {
        Self(i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
    }
}
