//! At-most-one-in-flight guards for background work
//!
//! `SingleFlight` guards one kind of operation (play, seek, refresh...).
//! `KeyedFlight` does the same per string key, so a cache can make sure a key
//! is only ever being loaded by one task.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, ensure};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct SingleFlight {
    name: &'static str,
    running: Arc<AtomicBool>,
}

/// Clears the running flag when dropped, whether the task finished, failed,
/// panicked or was aborted.
struct Release(Arc<AtomicBool>);

impl Drop for Release {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SingleFlight {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn `task` on `handle` unless a previous task of this guard is still
    /// running, in which case nothing happens and `None` is returned.
    pub fn launch<F>(&self, handle: &Handle, task: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!(guard = self.name, "Already in flight, ignoring request");
            return None;
        }

        let release = Release(self.running.clone());
        Some(handle.spawn(async move {
            let _release = release;
            task.await
        }))
    }

    pub fn check_not_running(&self) -> Result<()> {
        ensure!(!self.is_running(), "{} is still in flight", self.name);
        Ok(())
    }
}

/// Per-key variant of [`SingleFlight`].
#[derive(Debug, Default)]
pub struct KeyedFlight {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Keys claimed by one load. Dropping the claim releases them.
#[derive(Debug)]
pub struct KeyClaim {
    keys: Vec<String>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl KeyedFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every key of `keys` that is not already in flight. Duplicates are
    /// claimed once. Returns `None` when nothing could be claimed.
    pub fn claim<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Option<KeyClaim> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let claimed: Vec<String> = keys
            .into_iter()
            .filter(|key| in_flight.insert(key.to_string()))
            .map(str::to_string)
            .collect();

        if claimed.is_empty() {
            return None;
        }
        Some(KeyClaim {
            keys: claimed,
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }
}

impl KeyClaim {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for KeyClaim {
    fn drop(&mut self) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for key in &self.keys {
            in_flight.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn second_launch_is_ignored_while_running() {
        let guard = SingleFlight::new("refresh");
        let handle = Handle::current();
        let runs = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = {
            let runs = runs.clone();
            guard.launch(&handle, async move {
                runs.fetch_add(1, Ordering::SeqCst);
                let _ = release_rx.await;
            })
        };
        assert!(first.is_some());
        assert!(guard.check_not_running().is_err());

        let second = {
            let runs = runs.clone();
            guard.launch(&handle, async move {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert!(second.is_none());

        release_tx.send(()).expect("task waiting");
        first.expect("launched").await.expect("task completed");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(guard.check_not_running().is_ok());
    }

    #[tokio::test]
    async fn releases_after_failure_and_abort() {
        let guard = SingleFlight::new("seek");
        let handle = Handle::current();

        let failing = guard
            .launch(&handle, async { Err::<(), _>(anyhow::anyhow!("remote down")) })
            .expect("launched");
        assert!(failing.await.expect("joined").is_err());
        assert!(!guard.is_running());

        let pending = guard
            .launch(&handle, futures::future::pending::<()>())
            .expect("launched");
        pending.abort();
        assert!(pending.await.expect_err("aborted").is_cancelled());
        assert!(!guard.is_running());
    }

    #[tokio::test]
    async fn releases_after_panic() {
        let guard = SingleFlight::new("panicky");
        let task = guard
            .launch(&Handle::current(), async {
                if true {
                    panic!("boom");
                }
            })
            .expect("launched");
        assert!(task.await.expect_err("panicked").is_panic());
        assert!(!guard.is_running());
    }

    #[test]
    fn keyed_claims_are_exclusive_until_dropped() {
        let flight = KeyedFlight::new();

        let claim = flight.claim(["a", "b", "a"]).expect("claimed");
        assert_eq!(claim.keys(), ["a".to_string(), "b".to_string()]);

        let partial = flight.claim(["b", "c"]).expect("c is free");
        assert_eq!(partial.keys(), ["c".to_string()]);
        assert!(flight.claim(["a"]).is_none());

        drop(claim);
        assert!(!flight.is_in_flight("a"));
        assert!(flight.is_in_flight("c"));
    }
}
