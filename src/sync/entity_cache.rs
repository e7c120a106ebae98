//! Entity cache engine: memory, local storage and remote source kept in step
//!
//! Every key has one observable cell holding `Option<CacheState<V>>`. Asking
//! for a cell the first time starts a background load; the load consults local
//! storage under the validity policy, goes remote when needed, persists what it
//! got and publishes the outcome into the cell.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::context::SyncContext;
use super::remote::RemoteSource;
use super::single_flight::KeyedFlight;
use super::store::{LocalStore, Stored};
use super::validity::{CacheValidity, NeverValid, ValidityPolicy};
use super::weak_map::{Cell, WeakObservableMap};
use crate::error;
use crate::model::CacheState;

pub type StateCell<V> = Cell<Option<CacheState<V>>>;

/// Cache for one entity kind (tracks, artists, ...). Cheap to clone.
pub struct EntityCache<V: Send + 'static> {
    inner: Arc<Inner<V>>,
}

impl<V: Send + 'static> Clone for EntityCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<V: Send + 'static> {
    name: String,
    ctx: SyncContext,
    cells: WeakObservableMap<Option<CacheState<V>>>,
    flights: KeyedFlight,
    store: Arc<dyn LocalStore<V>>,
    remote: Arc<dyn RemoteSource<V>>,
    policy: Arc<dyn ValidityPolicy<V>>,
}

impl<V> EntityCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        ctx: &SyncContext,
        store: Arc<dyn LocalStore<V>>,
        remote: Arc<dyn RemoteSource<V>>,
        policy: Arc<dyn ValidityPolicy<V>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                ctx: ctx.clone(),
                cells: WeakObservableMap::new(),
                flights: KeyedFlight::new(),
                store,
                remote,
                policy,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Observable state for `key`. The first request for a key (or the first
    /// after its cell was dropped) loads it in the background.
    pub fn state_of(&self, key: &str) -> StateCell<V> {
        self.inner.cells.get_or_create(
            key,
            || None,
            |_| {
                let this = self.clone();
                let key = key.to_string();
                self.inner.ctx.handle.spawn(async move { this.load(&key).await });
            },
        )
    }

    /// Batch form of [`state_of`](Self::state_of): newly created keys are
    /// loaded together with one storage and one remote call.
    pub fn states_of(&self, keys: &[String]) -> Vec<StateCell<V>> {
        self.inner.cells.get_or_create_batch(
            keys,
            |_| None,
            |created| {
                let this = self.clone();
                let created = created.to_vec();
                self.inner
                    .ctx
                    .handle
                    .spawn(async move { this.load_many(&created).await });
            },
        )
    }

    /// Reload `key` from the remote source in the background, ignoring cache
    /// validity and local storage.
    pub fn refresh_from_remote(&self, key: &str) -> JoinHandle<()> {
        let this = self.clone();
        let key = key.to_string();
        self.inner
            .ctx
            .handle
            .spawn(async move { this.refresh(&key).await })
    }

    pub fn refresh_many_from_remote(&self, keys: &[String]) -> JoinHandle<()> {
        let this = self.clone();
        let keys = keys.to_vec();
        self.inner
            .ctx
            .handle
            .spawn(async move { this.refresh_many(&keys).await })
    }

    /// Run the load pipeline for `key` under the configured policy.
    pub async fn load(&self, key: &str) {
        let policy = self.inner.policy.clone();
        self.run(&[key.to_string()], policy.as_ref()).await;
    }

    pub async fn load_many(&self, keys: &[String]) {
        let policy = self.inner.policy.clone();
        self.run(keys, policy.as_ref()).await;
    }

    /// Run the load pipeline for `key` as a forced refresh.
    pub async fn refresh(&self, key: &str) {
        self.run(&[key.to_string()], &NeverValid).await;
    }

    pub async fn refresh_many(&self, keys: &[String]) {
        self.run(keys, &NeverValid).await;
    }

    pub fn current_state(&self, key: &str) -> Option<CacheState<V>> {
        self.inner.cells.get_value(key).flatten()
    }

    pub fn cached_value(&self, key: &str) -> Option<V> {
        self.current_state(key)
            .and_then(|state| state.value().cloned())
    }

    /// Forget every cell. Holders of old cells stop receiving updates.
    pub fn invalidate_all(&self) {
        tracing::debug!(cache = %self.inner.name, "Dropping all cached states");
        self.inner.cells.clear();
    }

    fn publish(&self, key: &str, state: CacheState<V>) {
        self.inner.cells.update(key, Some(state));
    }

    fn needs_load(
        &self,
        current: Option<&CacheState<V>>,
        policy: &dyn ValidityPolicy<V>,
        now: DateTime<Utc>,
    ) -> bool {
        let forced = !policy.allows_local_lookup();
        match current {
            None | Some(CacheState::Error(_)) => true,
            // still marked refreshing after its load was cancelled
            Some(CacheState::Refreshing { .. }) => true,
            Some(CacheState::NotFound) => forced,
            Some(CacheState::Loaded { value, cache_time }) => {
                forced || policy.validity(value, *cache_time, now) != CacheValidity::Valid
            }
        }
    }

    async fn run(&self, keys: &[String], policy: &dyn ValidityPolicy<V>) {
        let inner = &self.inner;
        let now = inner.ctx.clock.now();

        let mut seen = HashSet::new();
        let candidates: Vec<&str> = keys
            .iter()
            .filter(|key| seen.insert(key.as_str()))
            .filter(|key| self.needs_load(self.current_state(key).as_ref(), policy, now))
            .map(String::as_str)
            .collect();

        // keys already being loaded by another task are left to it
        let Some(claim) = inner.flights.claim(candidates) else {
            return;
        };
        let mut pending: Vec<String> = claim.keys().to_vec();

        if policy.allows_local_lookup() {
            let stored = self.read_local(&pending).await;
            let now = inner.ctx.clock.now();

            pending = pending
                .into_iter()
                .zip(stored)
                .filter_map(|(key, stored)| {
                    let Some(Stored { value, updated_at }) = stored else {
                        return Some(key);
                    };
                    match policy.validity(&value, updated_at, now) {
                        CacheValidity::Valid => {
                            self.publish(&key, CacheState::Loaded { value, cache_time: updated_at });
                            None
                        }
                        CacheValidity::Transient => {
                            self.publish(&key, CacheState::Loaded { value, cache_time: updated_at });
                            Some(key)
                        }
                        CacheValidity::Invalid => Some(key),
                    }
                })
                .collect();
        }

        if pending.is_empty() {
            return;
        }

        let mut rollback = Rollback::new(&inner.cells);
        for key in &pending {
            let previous = self.current_state(key);
            let refreshing = previous
                .as_ref()
                .map_or_else(CacheState::refreshing, CacheState::to_refreshing);
            rollback.record(key, previous);
            self.publish(key, refreshing);
        }

        tracing::debug!(cache = %inner.name, count = pending.len(), "Fetching from remote");
        let started = inner.ctx.clock.now();
        let fetched = self.fetch_remote(&pending).await;
        let finished = inner.ctx.clock.now();
        let fetched_at = started + (finished - started) / 2;

        match fetched {
            Ok(values) => {
                let found: Vec<(String, V)> = pending
                    .iter()
                    .zip(&values)
                    .filter_map(|(key, value)| value.clone().map(|v| (key.clone(), v)))
                    .collect();
                self.persist(found, fetched_at).await;

                for (key, value) in pending.iter().zip(values) {
                    match value {
                        Some(value) => self.publish(
                            key,
                            CacheState::Loaded {
                                value,
                                cache_time: fetched_at,
                            },
                        ),
                        None => {
                            tracing::debug!(cache = %inner.name, key = %key, "Not found on remote");
                            self.publish(key, CacheState::NotFound);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(cache = %inner.name, count = pending.len(), error = %e, "Remote fetch failed");
                let shared = error::share(e);
                for key in &pending {
                    self.publish(key, CacheState::Error(shared.clone()));
                }
            }
        }

        rollback.disarm();
        drop(claim);
    }

    /// Local lookup; a storage failure counts as a miss for every key.
    async fn read_local(&self, keys: &[String]) -> Vec<Option<Stored<V>>> {
        let inner = &self.inner;
        let label = format!("{}: fetch", inner.name);
        let result: Result<Vec<Option<Stored<V>>>> = inner
            .ctx
            .database
            .transaction(&label, || async {
                match keys {
                    [key] => Ok(vec![inner.store.fetch_one(key).await?]),
                    _ => inner.store.fetch_many(keys).await,
                }
            })
            .await;

        match result {
            Ok(stored) if stored.len() == keys.len() => stored,
            Ok(stored) => {
                tracing::warn!(
                    cache = %inner.name,
                    expected = keys.len(),
                    got = stored.len(),
                    "Local store returned wrong number of rows, ignoring"
                );
                vec![None; keys.len()]
            }
            Err(e) => {
                tracing::warn!(cache = %inner.name, error = %e, "Local lookup failed, going remote");
                vec![None; keys.len()]
            }
        }
    }

    async fn fetch_remote(&self, keys: &[String]) -> Result<Vec<Option<V>>> {
        let values = match keys {
            [key] => vec![self.inner.remote.fetch_one(key).await?],
            _ => self.inner.remote.fetch_many(keys).await?,
        };
        anyhow::ensure!(
            values.len() == keys.len(),
            "remote returned {} values for {} keys",
            values.len(),
            keys.len()
        );
        Ok(values)
    }

    async fn persist(&self, found: Vec<(String, V)>, fetched_at: DateTime<Utc>) {
        if found.is_empty() {
            return;
        }
        let inner = &self.inner;
        let label = format!("{}: persist", inner.name);
        let result = inner
            .ctx
            .database
            .transaction(&label, || async {
                match <[_; 1]>::try_from(found) {
                    Ok([(key, value)]) => inner.store.persist(&key, value, fetched_at).await.map(drop),
                    Err(found) => inner.store.persist_many(found, fetched_at).await,
                }
            })
            .await;

        if let Err(e) = result {
            tracing::warn!(cache = %inner.name, error = %e, "Failed to persist fetched values");
        }
    }
}

/// Puts back the states a load replaced with `Refreshing` if the load is
/// dropped before it publishes its outcome.
struct Rollback<'a, V: Clone> {
    cells: &'a WeakObservableMap<Option<CacheState<V>>>,
    previous: Vec<(String, Option<CacheState<V>>)>,
}

impl<'a, V: Clone> Rollback<'a, V> {
    fn new(cells: &'a WeakObservableMap<Option<CacheState<V>>>) -> Self {
        Self {
            cells,
            previous: Vec::new(),
        }
    }

    fn record(&mut self, key: &str, state: Option<CacheState<V>>) {
        self.previous.push((key.to_string(), state));
    }

    fn disarm(mut self) {
        self.previous.clear();
    }
}

impl<V: Clone> Drop for Rollback<'_, V> {
    fn drop(&mut self) {
        for (key, previous) in self.previous.drain(..) {
            self.cells.update_with(&key, |current| match current {
                Some(CacheState::Refreshing { .. }) => previous,
                other => other.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sync::store::{Database, MemoryStore};
    use crate::sync::validity::{AlwaysValid, Ttl};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::runtime::Handle;
    use tokio::sync::Semaphore;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::milliseconds(ms)
    }

    #[derive(Default)]
    struct CountingStore {
        rows: MemoryStore<String>,
        reads: AtomicUsize,
        writes: AtomicUsize,
        fail_reads: bool,
    }

    #[async_trait]
    impl LocalStore<String> for CountingStore {
        async fn fetch_one(&self, id: &str) -> Result<Option<Stored<String>>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(!self.fail_reads, "corrupt row");
            self.rows.fetch_one(id).await
        }

        async fn fetch_many(&self, ids: &[String]) -> Result<Vec<Option<Stored<String>>>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(!self.fail_reads, "corrupt row");
            Ok(ids.iter().map(|id| self.rows.get(id)).collect())
        }

        async fn persist(&self, id: &str, value: String, fetched_at: DateTime<Utc>) -> Result<Stored<String>> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.rows.persist(id, value, fetched_at).await
        }

        async fn persist_many(&self, rows: Vec<(String, String)>, fetched_at: DateTime<Utc>) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            for (id, value) in rows {
                self.rows.insert(&id, value, fetched_at);
            }
            Ok(())
        }
    }

    /// Remote that answers from a map, optionally waiting for a permit per call
    /// and advancing the clock to simulate latency.
    struct FakeRemote {
        values: Mutex<HashMap<String, String>>,
        calls: Mutex<Vec<Vec<String>>>,
        gate: Option<Arc<Semaphore>>,
        clock: Arc<ManualClock>,
        latency_ms: i64,
        fail: Mutex<bool>,
    }

    impl FakeRemote {
        fn new(clock: Arc<ManualClock>, values: &[(&str, &str)]) -> Self {
            Self {
                values: Mutex::new(
                    values
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
                gate: None,
                clock,
                latency_ms: 0,
                fail: Mutex::new(false),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        async fn answer(&self, ids: &[String]) -> Result<Vec<Option<String>>> {
            self.calls.lock().unwrap().push(ids.to_vec());
            if let Some(gate) = &self.gate {
                gate.acquire().await?.forget();
            }
            self.clock.advance_ms(self.latency_ms);
            anyhow::ensure!(!*self.fail.lock().unwrap(), "status code 500");
            let values = self.values.lock().unwrap();
            Ok(ids.iter().map(|id| values.get(id).cloned()).collect())
        }
    }

    #[async_trait]
    impl RemoteSource<String> for FakeRemote {
        async fn fetch_one(&self, id: &str) -> Result<Option<String>> {
            Ok(self.answer(&[id.to_string()]).await?.pop().flatten())
        }

        async fn fetch_many(&self, ids: &[String]) -> Result<Vec<Option<String>>> {
            self.answer(ids).await
        }
    }

    struct Harness {
        store: Arc<CountingStore>,
        remote: Arc<FakeRemote>,
        cache: EntityCache<String>,
    }

    fn harness(
        store: CountingStore,
        remote: impl FnOnce(Arc<ManualClock>) -> FakeRemote,
        policy: Arc<dyn ValidityPolicy<String>>,
    ) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000));
        let ctx = SyncContext::new(
            Handle::current(),
            Arc::new(Database::new("test")),
            clock.clone(),
        );
        let store = Arc::new(store);
        let remote = Arc::new(remote(clock.clone()));
        let cache = EntityCache::new("tracks", &ctx, store.clone(), remote.clone(), policy);
        Harness {
            store,
            remote,
            cache,
        }
    }

    async fn wait_for<V: Clone>(
        cell: &StateCell<V>,
        done: impl Fn(&CacheState<V>) -> bool,
    ) -> CacheState<V> {
        let mut rx = cell.subscribe();
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|state| state.as_ref().is_some_and(&done)),
        )
        .await
        .expect("timed out waiting for state")
        .expect("cell alive");
        state.clone().expect("state present")
    }

    #[tokio::test]
    async fn first_request_goes_remote_and_attributes_midpoint() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(
            CountingStore::default(),
            |clock| FakeRemote {
                gate: Some(gate.clone()),
                latency_ms: 100,
                ..FakeRemote::new(clock, &[("t1", "Song")])
            },
            Arc::new(AlwaysValid),
        );

        let cell = h.cache.state_of("t1");
        let refreshing = wait_for(&cell, CacheState::is_refreshing).await;
        assert!(refreshing.value().is_none());

        gate.add_permits(1);
        let loaded = wait_for(&cell, CacheState::is_loaded).await;

        assert_eq!(loaded.value().map(String::as_str), Some("Song"));
        assert_eq!(loaded.cache_time(), Some(at(1_050)));
        assert_eq!(h.store.reads.load(Ordering::SeqCst), 1);
        assert_eq!(h.remote.call_count(), 1);
        assert_eq!(h.store.rows.get("t1").map(|s| s.value), Some("Song".to_string()));
    }

    #[tokio::test]
    async fn concurrent_requests_fetch_once() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(
            CountingStore::default(),
            |clock| FakeRemote {
                gate: Some(gate.clone()),
                ..FakeRemote::new(clock, &[("t1", "Song")])
            },
            Arc::new(AlwaysValid),
        );

        let cells: Vec<_> = (0..10).map(|_| h.cache.state_of("t1")).collect();
        wait_for(&cells[0], CacheState::is_refreshing).await;

        let loads: Vec<_> = (0..5)
            .map(|_| {
                let cache = h.cache.clone();
                tokio::spawn(async move { cache.refresh("t1").await })
            })
            .collect();
        for load in loads {
            load.await.expect("joined");
        }

        gate.add_permits(10);
        wait_for(&cells[9], CacheState::is_loaded).await;
        assert_eq!(h.remote.call_count(), 1);
    }

    #[tokio::test]
    async fn valid_local_value_skips_remote() {
        let store = CountingStore::default();
        store.rows.insert("t1", "Stored".to_string(), at(900));
        let h = harness(
            store,
            |clock| FakeRemote::new(clock, &[("t1", "Remote")]),
            Arc::new(Ttl::<String>::new(Some(chrono::Duration::seconds(60)), None)),
        );

        h.cache.load("t1").await;
        // nobody holds a cell, so nothing is published, but nothing is fetched either
        assert_eq!(h.remote.call_count(), 0);

        let cell = h.cache.state_of("t1");
        let loaded = wait_for(&cell, CacheState::is_loaded).await;
        assert_eq!(loaded.value().map(String::as_str), Some("Stored"));
        assert_eq!(loaded.cache_time(), Some(at(900)));
        assert_eq!(h.remote.call_count(), 0);
    }

    #[tokio::test]
    async fn transient_local_value_is_served_then_revalidated() {
        let store = CountingStore::default();
        store.rows.insert("t1", "Stale".to_string(), at(0));
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(
            store,
            |clock| FakeRemote {
                gate: Some(gate.clone()),
                ..FakeRemote::new(clock, &[("t1", "Fresh")])
            },
            Arc::new(Ttl::<String>::new(
                Some(chrono::Duration::milliseconds(500)),
                Some(chrono::Duration::seconds(60)),
            )),
        );

        let cell = h.cache.state_of("t1");
        let refreshing = wait_for(&cell, CacheState::is_refreshing).await;
        assert_eq!(refreshing.value().map(String::as_str), Some("Stale"));
        assert_eq!(refreshing.cache_time(), Some(at(0)));

        gate.add_permits(1);
        let loaded = wait_for(&cell, |s| s.value().map(String::as_str) == Some("Fresh")).await;
        assert_eq!(loaded.cache_time(), Some(at(1_000)));
    }

    #[tokio::test]
    async fn storage_failure_falls_through_to_remote() {
        let h = harness(
            CountingStore {
                fail_reads: true,
                ..CountingStore::default()
            },
            |clock| FakeRemote::new(clock, &[("t1", "Song")]),
            Arc::new(AlwaysValid),
        );

        let cell = h.cache.state_of("t1");
        let loaded = wait_for(&cell, CacheState::is_loaded).await;
        assert_eq!(loaded.value().map(String::as_str), Some("Song"));
    }

    #[tokio::test]
    async fn not_found_is_authoritative_until_forced() {
        let h = harness(
            CountingStore::default(),
            |clock| FakeRemote::new(clock, &[]),
            Arc::new(AlwaysValid),
        );

        let cell = h.cache.state_of("ghost");
        wait_for(&cell, CacheState::is_not_found).await;
        assert_eq!(h.remote.call_count(), 1);

        h.cache.load("ghost").await;
        assert_eq!(h.remote.call_count(), 1);

        h.remote
            .values
            .lock()
            .unwrap()
            .insert("ghost".to_string(), "Appeared".to_string());
        h.cache.refresh("ghost").await;
        assert_eq!(h.remote.call_count(), 2);
        assert_eq!(h.cache.cached_value("ghost"), Some("Appeared".to_string()));
    }

    #[tokio::test]
    async fn remote_failure_publishes_error_and_retries_on_request() {
        let h = harness(
            CountingStore::default(),
            |clock| FakeRemote::new(clock, &[("t1", "Song")]),
            Arc::new(AlwaysValid),
        );
        *h.remote.fail.lock().unwrap() = true;

        let cell = h.cache.state_of("t1");
        let failed = wait_for(&cell, |s| s.error().is_some()).await;
        assert!(failed.error().is_some_and(|e| e.to_string().contains("500")));

        *h.remote.fail.lock().unwrap() = false;
        h.cache.load("t1").await;
        assert!(cell.with(|s| s.as_ref().is_some_and(CacheState::is_loaded)));
        assert_eq!(h.remote.call_count(), 2);
    }

    #[tokio::test]
    async fn batch_uses_one_call_per_tier() {
        let store = CountingStore::default();
        store.rows.insert("a", "Local A".to_string(), at(1_000));
        let h = harness(
            store,
            |clock| FakeRemote::new(clock, &[("b", "Remote B")]),
            Arc::new(AlwaysValid),
        );
        let keys: Vec<String> = ["a", "b", "c", "a"].iter().map(|k| k.to_string()).collect();

        let cells = h.cache.states_of(&keys);
        assert!(Arc::ptr_eq(&cells[0], &cells[3]));
        wait_for(&cells[2], CacheState::is_not_found).await;
        wait_for(&cells[1], CacheState::is_loaded).await;

        assert_eq!(h.cache.cached_value("a"), Some("Local A".to_string()));
        assert_eq!(h.store.reads.load(Ordering::SeqCst), 1);
        assert_eq!(
            *h.remote.calls.lock().unwrap(),
            vec![vec!["b".to_string(), "c".to_string()]]
        );
    }

    #[tokio::test]
    async fn batch_fetch_is_stored_in_one_write() {
        let h = harness(
            CountingStore::default(),
            |clock| FakeRemote::new(clock, &[("x", "Song X"), ("y", "Song Y")]),
            Arc::new(AlwaysValid),
        );
        let keys: Vec<String> = ["x", "y", "z"].iter().map(|k| k.to_string()).collect();

        let cells = h.cache.states_of(&keys);
        for cell in &cells[..2] {
            wait_for(cell, CacheState::is_loaded).await;
        }
        wait_for(&cells[2], CacheState::is_not_found).await;

        assert_eq!(h.store.writes.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.rows.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_load_restores_previous_state() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(
            CountingStore::default(),
            |clock| FakeRemote {
                gate: Some(gate.clone()),
                ..FakeRemote::new(clock, &[("t1", "Song")])
            },
            Arc::new(AlwaysValid),
        );
        let cell = h.cache.state_of("t1");
        wait_for(&cell, CacheState::is_refreshing).await;

        // release the background load as a failure so the cell settles on Error
        *h.remote.fail.lock().unwrap() = true;
        gate.add_permits(1);
        wait_for(&cell, |s| s.error().is_some()).await;
        *h.remote.fail.lock().unwrap() = false;

        let forced = h.cache.refresh_from_remote("t1");
        wait_for(&cell, CacheState::is_refreshing).await;
        forced.abort();
        assert!(forced.await.expect_err("aborted").is_cancelled());

        assert!(cell.with(|s| s.as_ref().is_some_and(|s| s.error().is_some())));
        gate.add_permits(1);
        h.cache.load("t1").await;
        assert_eq!(h.cache.cached_value("t1"), Some("Song".to_string()));
    }

    #[tokio::test]
    async fn dropped_cell_is_reloaded_on_next_request() {
        let h = harness(
            CountingStore::default(),
            |clock| FakeRemote::new(clock, &[("t1", "Song")]),
            Arc::new(AlwaysValid),
        );

        let cell = h.cache.state_of("t1");
        wait_for(&cell, CacheState::is_loaded).await;
        drop(cell);

        let cell = h.cache.state_of("t1");
        let loaded = wait_for(&cell, CacheState::is_loaded).await;
        assert_eq!(loaded.value().map(String::as_str), Some("Song"));
        // second lifetime is served from local storage
        assert_eq!(h.remote.call_count(), 1);
        assert_eq!(h.store.reads.load(Ordering::SeqCst), 2);
    }
}
