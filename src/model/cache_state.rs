//! Load status and optimistic toggle states published through observable cells

use chrono::{DateTime, Utc};

use crate::error::SharedError;

/// Load status of a single cached entity.
///
/// A cell holding `None` instead of a `CacheState` has never been requested.
#[derive(Clone, Debug)]
pub enum CacheState<V> {
    /// A fetch is in flight; the previously cached value, if any, is still shown.
    Refreshing {
        value: Option<V>,
        cache_time: Option<DateTime<Utc>>,
    },
    Loaded {
        value: V,
        cache_time: DateTime<Utc>,
    },
    /// The remote source confirmed there is no such entity.
    NotFound,
    Error(SharedError),
}

impl<V> CacheState<V> {
    pub fn refreshing() -> Self {
        CacheState::Refreshing {
            value: None,
            cache_time: None,
        }
    }

    pub fn value(&self) -> Option<&V> {
        match self {
            CacheState::Refreshing { value, .. } => value.as_ref(),
            CacheState::Loaded { value, .. } => Some(value),
            CacheState::NotFound | CacheState::Error(_) => None,
        }
    }

    pub fn cache_time(&self) -> Option<DateTime<Utc>> {
        match self {
            CacheState::Refreshing { cache_time, .. } => *cache_time,
            CacheState::Loaded { cache_time, .. } => Some(*cache_time),
            CacheState::NotFound | CacheState::Error(_) => None,
        }
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self, CacheState::Refreshing { .. })
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, CacheState::Loaded { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheState::NotFound)
    }

    pub fn error(&self) -> Option<&SharedError> {
        match self {
            CacheState::Error(e) => Some(e),
            _ => None,
        }
    }
}

impl<V: Clone> CacheState<V> {
    /// The `Refreshing` state that keeps showing whatever this state had.
    pub fn to_refreshing(&self) -> Self {
        CacheState::Refreshing {
            value: self.value().cloned(),
            cache_time: self.cache_time(),
        }
    }
}

/// A user-controllable attribute that may have a change in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToggleableState<T> {
    Set(T),
    TogglingTo(T),
}

impl<T: Copy> ToggleableState<T> {
    /// The value the UI should show: the settled value or the pending target.
    pub fn value(&self) -> T {
        match self {
            ToggleableState::Set(v) | ToggleableState::TogglingTo(v) => *v,
        }
    }

    pub fn settled(&self) -> Option<T> {
        match self {
            ToggleableState::Set(v) => Some(*v),
            ToggleableState::TogglingTo(_) => None,
        }
    }

    pub fn is_toggling(&self) -> bool {
        matches!(self, ToggleableState::TogglingTo(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refreshing_keeps_stale_value() {
        let at = DateTime::<Utc>::UNIX_EPOCH;
        let loaded = CacheState::Loaded { value: 7, cache_time: at };
        let refreshing = loaded.to_refreshing();
        assert!(refreshing.is_refreshing());
        assert_eq!(refreshing.value(), Some(&7));
        assert_eq!(refreshing.cache_time(), Some(at));

        let from_error = CacheState::<i32>::Error(crate::error::share(anyhow::anyhow!("boom")))
            .to_refreshing();
        assert_eq!(from_error.value(), None);
    }

    #[test]
    fn toggle_exposes_pending_target() {
        let toggling = ToggleableState::TogglingTo(true);
        assert!(toggling.value());
        assert_eq!(toggling.settled(), None);
        assert_eq!(ToggleableState::Set(false).settled(), Some(false));
    }
}
