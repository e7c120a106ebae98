//! Local persistent storage behind strictly serialized transactions

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

/// A value as kept in local storage, with the instant it was last refreshed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stored<V> {
    pub value: V,
    pub updated_at: DateTime<Utc>,
}

impl<V> Stored<V> {
    pub fn new(value: V, updated_at: DateTime<Utc>) -> Self {
        Self { value, updated_at }
    }
}

/// Runs storage transactions one at a time, in the order they were requested.
#[derive(Debug)]
pub struct Database {
    name: String,
    gate: AsyncMutex<()>,
}

impl Database {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gate: AsyncMutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `body` as the only transaction on this database. `label` names the
    /// transaction in logs.
    pub async fn transaction<T, F, Fut>(&self, label: &str, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let queued = Instant::now();
        let _gate = self.gate.lock().await;
        let started = Instant::now();

        let result = body().await;

        tracing::trace!(
            database = %self.name,
            transaction = label,
            waited_ms = started.duration_since(queued).as_millis() as u64,
            took_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Transaction finished"
        );
        result
    }
}

/// Local storage for one entity kind.
///
/// Implementations are only called from inside [`Database::transaction`].
#[async_trait]
pub trait LocalStore<V: Send + 'static>: Send + Sync {
    async fn fetch_one(&self, id: &str) -> Result<Option<Stored<V>>>;

    /// Positional: slot `i` answers `ids[i]`.
    async fn fetch_many(&self, ids: &[String]) -> Result<Vec<Option<Stored<V>>>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            found.push(self.fetch_one(id).await?);
        }
        Ok(found)
    }

    /// Store a freshly fetched value and return what was stored.
    async fn persist(&self, id: &str, value: V, fetched_at: DateTime<Utc>) -> Result<Stored<V>>;

    /// Store several values fetched together.
    async fn persist_many(&self, rows: Vec<(String, V)>, fetched_at: DateTime<Utc>) -> Result<()> {
        for (id, value) in rows {
            self.persist(&id, value, fetched_at).await?;
        }
        Ok(())
    }
}

/// In-memory store, used when nothing should touch the disk and in tests.
#[derive(Debug)]
pub struct MemoryStore<V> {
    rows: Mutex<HashMap<String, Stored<V>>>,
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> MemoryStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: &str, value: V, updated_at: DateTime<Utc>) {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.to_string(), Stored::new(value, updated_at));
    }

    pub fn get(&self, id: &str) -> Option<Stored<V>> {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<V> LocalStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn fetch_one(&self, id: &str) -> Result<Option<Stored<V>>> {
        Ok(self.get(id))
    }

    async fn persist(&self, id: &str, value: V, fetched_at: DateTime<Utc>) -> Result<Stored<V>> {
        self.insert(id, value.clone(), fetched_at);
        Ok(Stored::new(value, fetched_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn transactions_never_overlap() {
        let db = Arc::new(Database::new("test"));
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let db = db.clone();
                let active = active.clone();
                let max_seen = max_seen.clone();
                tokio::spawn(async move {
                    db.transaction("overlap check", || async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(i)
                    })
                    .await
                })
            })
            .collect();

        for task in tasks {
            task.await.expect("joined").expect("transaction ok");
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn memory_store_round_trips_positionally() {
        let store = MemoryStore::new();
        let at = DateTime::<Utc>::UNIX_EPOCH;
        store.persist("a", 1, at).await.expect("persist");

        let found = store
            .fetch_many(&["missing".to_string(), "a".to_string()])
            .await
            .expect("fetch");
        assert_eq!(found, vec![None, Some(Stored::new(1, at))]);
    }
}
