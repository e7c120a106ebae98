//! Cache validity policies
//!
//! A policy looks at when a cached value was last refreshed and decides whether
//! it can be served as is, served while being refreshed in the background, or
//! has to be fetched again before anything is shown.

use std::fmt;

use chrono::{DateTime, Duration, Utc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheValidity {
    Valid,
    /// Usable, but should be silently refreshed.
    Transient,
    Invalid,
}

pub trait ValidityPolicy<V>: Send + Sync {
    fn validity(&self, value: &V, cache_time: DateTime<Utc>, now: DateTime<Utc>) -> CacheValidity;

    /// Whether the engine may consult local storage before going remote.
    fn allows_local_lookup(&self) -> bool {
        true
    }
}

/// Cached values never expire.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysValid;

impl<V> ValidityPolicy<V> for AlwaysValid {
    fn validity(&self, _: &V, _: DateTime<Utc>, _: DateTime<Utc>) -> CacheValidity {
        CacheValidity::Valid
    }
}

/// Every value is stale and local storage is skipped. Used for forced refreshes.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverValid;

impl<V> ValidityPolicy<V> for NeverValid {
    fn validity(&self, _: &V, _: DateTime<Utc>, _: DateTime<Utc>) -> CacheValidity {
        CacheValidity::Invalid
    }

    fn allows_local_lookup(&self) -> bool {
        false
    }
}

/// Age-based expiry with independent transient and invalid thresholds.
pub struct Ttl<V> {
    transient: Option<Duration>,
    invalid: Option<Duration>,
    update_time: Option<fn(&V) -> DateTime<Utc>>,
}

impl<V> Ttl<V> {
    pub fn new(transient: Option<Duration>, invalid: Option<Duration>) -> Self {
        Self {
            transient,
            invalid,
            update_time: None,
        }
    }

    /// Convenience constructor from `std` durations, as found in configuration.
    pub fn from_std(
        transient: Option<std::time::Duration>,
        invalid: Option<std::time::Duration>,
    ) -> Self {
        let convert = |d: std::time::Duration| Duration::from_std(d).unwrap_or(Duration::MAX);
        Self::new(transient.map(convert), invalid.map(convert))
    }

    /// Age values by a timestamp carried in the value instead of the cache time.
    pub fn with_update_time(mut self, update_time: fn(&V) -> DateTime<Utc>) -> Self {
        self.update_time = Some(update_time);
        self
    }
}

impl<V> fmt::Debug for Ttl<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ttl")
            .field("transient", &self.transient)
            .field("invalid", &self.invalid)
            .field("custom_update_time", &self.update_time.is_some())
            .finish()
    }
}

impl<V> ValidityPolicy<V> for Ttl<V> {
    fn validity(&self, value: &V, cache_time: DateTime<Utc>, now: DateTime<Utc>) -> CacheValidity {
        let updated = self.update_time.map_or(cache_time, |f| f(value));
        ttl_validity(now - updated, self.transient, self.invalid)
    }
}

/// Verdict for a value of the given age. Thresholds are inclusive; an unset
/// threshold never triggers.
pub fn ttl_validity(
    age: Duration,
    transient: Option<Duration>,
    invalid: Option<Duration>,
) -> CacheValidity {
    if invalid.is_some_and(|ttl| age >= ttl) {
        CacheValidity::Invalid
    } else if transient.is_some_and(|ttl| age >= ttl) {
        CacheValidity::Transient
    } else {
        CacheValidity::Valid
    }
}
