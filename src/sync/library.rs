//! Saved-library membership: which entities the user has saved
//!
//! Two views are kept in step: the whole library as one observable set, and a
//! per-entity `ToggleableState<bool>` cell that also carries optimistic
//! save/unsave changes while they are in flight.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::context::SyncContext;
use super::json_store::DocumentStore;
use super::observable::Observable;
use super::single_flight::{KeyedFlight, SingleFlight};
use super::store::Stored;
use super::validity::{CacheValidity, ValidityPolicy};
use super::weak_map::{Cell, WeakObservableMap};
use crate::error;
use crate::model::{CacheState, Library, ToggleableState};

pub type LibraryCell = Arc<Observable<Option<CacheState<Library>>>>;
pub type SavedCell = Cell<Option<ToggleableState<bool>>>;

/// Stored saved flag for one entity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedFlag {
    pub saved: bool,
    /// When the entity was saved, if known. Unsaved entities have none.
    pub saved_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SavedStore: Send + Sync {
    async fn saved_flag(&self, id: &str) -> Result<Option<Stored<SavedFlag>>> {
        let mut flags = self.saved_flags(&[id.to_string()]).await?;
        Ok(flags.pop().flatten())
    }

    async fn saved_flags(&self, ids: &[String]) -> Result<Vec<Option<Stored<SavedFlag>>>>;

    async fn library(&self) -> Result<Option<Library>>;

    /// Every id stored as saved, including flags written before any library
    /// was stored.
    async fn saved_ids(&self) -> Result<HashSet<String>>;

    /// Replace the stored library with `library`; `removed` and `added` are the
    /// ids whose membership changed.
    async fn replace_library(
        &self,
        library: &Library,
        removed: &[String],
        added: &[String],
    ) -> Result<()>;

    async fn set_saved(&self, id: &str, flag: SavedFlag, at: DateTime<Utc>) -> Result<()>;

    async fn set_saved_many(&self, flags: Vec<(String, SavedFlag)>, at: DateTime<Utc>) -> Result<()> {
        for (id, flag) in flags {
            self.set_saved(&id, flag, at).await?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait SavedRemote: Send + Sync {
    /// Every saved id.
    async fn fetch_library(&self) -> Result<Vec<String>>;

    /// Positional membership check.
    async fn contains(&self, ids: &[String]) -> Result<Vec<bool>>;

    async fn save(&self, ids: &[String]) -> Result<()>;

    async fn unsave(&self, ids: &[String]) -> Result<()>;
}

/// On-disk layout of a saved-state store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SavedDocument {
    pub flags: HashMap<String, Stored<SavedFlag>>,
    pub library_time: Option<DateTime<Utc>>,
}

#[async_trait]
impl SavedStore for DocumentStore<SavedDocument> {
    async fn saved_flags(&self, ids: &[String]) -> Result<Vec<Option<Stored<SavedFlag>>>> {
        Ok(self.read(|doc| ids.iter().map(|id| doc.flags.get(id).cloned()).collect()))
    }

    async fn library(&self) -> Result<Option<Library>> {
        Ok(self.read(|doc| {
            doc.library_time.map(|cache_time| {
                let ids = doc
                    .flags
                    .iter()
                    .filter(|(_, flag)| flag.value.saved)
                    .map(|(id, _)| id.clone());
                Library::new(ids, cache_time)
            })
        }))
    }

    async fn saved_ids(&self) -> Result<HashSet<String>> {
        Ok(self.read(|doc| {
            doc.flags
                .iter()
                .filter(|(_, flag)| flag.value.saved)
                .map(|(id, _)| id.clone())
                .collect()
        }))
    }

    async fn replace_library(
        &self,
        library: &Library,
        removed: &[String],
        added: &[String],
    ) -> Result<()> {
        let at = library.cache_time;
        self.write(|doc| {
            for id in removed {
                doc.flags.insert(
                    id.clone(),
                    Stored::new(SavedFlag { saved: false, saved_at: None }, at),
                );
            }
            for id in added {
                doc.flags.insert(
                    id.clone(),
                    Stored::new(SavedFlag { saved: true, saved_at: Some(at) }, at),
                );
            }
            doc.library_time = Some(at);
        })
        .await
    }

    async fn set_saved(&self, id: &str, flag: SavedFlag, at: DateTime<Utc>) -> Result<()> {
        self.write(|doc| {
            doc.flags.insert(id.to_string(), Stored::new(flag, at));
        })
        .await
    }

    async fn set_saved_many(&self, flags: Vec<(String, SavedFlag)>, at: DateTime<Utc>) -> Result<()> {
        self.write(|doc| {
            for (id, flag) in flags {
                doc.flags.insert(id, Stored::new(flag, at));
            }
        })
        .await
    }
}

/// Saved-state engine for one entity kind. Cheap to clone.
#[derive(Clone)]
pub struct SavedStateEngine {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    ctx: SyncContext,
    store: Arc<dyn SavedStore>,
    remote: Arc<dyn SavedRemote>,
    policy: Arc<dyn ValidityPolicy<Library>>,
    library: LibraryCell,
    saved: WeakObservableMap<Option<ToggleableState<bool>>>,
    library_flight: SingleFlight,
    checks: KeyedFlight,
    toggles: KeyedFlight,
    /// Bumped on account switch so work started for the previous user is discarded.
    generation: AtomicU64,
}

impl SavedStateEngine {
    pub fn new(
        name: impl Into<String>,
        ctx: &SyncContext,
        store: Arc<dyn SavedStore>,
        remote: Arc<dyn SavedRemote>,
        policy: Arc<dyn ValidityPolicy<Library>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                ctx: ctx.clone(),
                store,
                remote,
                policy,
                library: Arc::new(Observable::new(None)),
                saved: WeakObservableMap::new(),
                library_flight: SingleFlight::new("refresh-library"),
                checks: KeyedFlight::new(),
                toggles: KeyedFlight::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// The whole library. The first access loads it from local storage, and
    /// from the remote source if the stored copy is missing or stale.
    pub fn library(&self) -> LibraryCell {
        if self.inner.library.with(Option::is_none) {
            let this = self.clone();
            self.inner
                .library_flight
                .launch(&self.inner.ctx.handle, async move { this.load_library().await });
        }
        self.inner.library.clone()
    }

    /// Fetch the whole library from the remote source unless a refresh is
    /// already running.
    pub fn refresh_library(&self) -> Option<JoinHandle<()>> {
        let this = self.clone();
        self.inner
            .library_flight
            .launch(&self.inner.ctx.handle, async move { this.sync_library().await })
    }

    /// Local-first library load, going remote only when the stored copy is not
    /// valid under the library policy.
    pub async fn load_library(&self) {
        let inner = &self.inner;
        let generation = self.generation();
        let label = format!("{}: load library", inner.name);

        let stored = inner
            .ctx
            .database
            .transaction(&label, || async { inner.store.library().await })
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(library = %inner.name, error = %e, "Stored library unreadable");
                None
            });

        if let Some(library) = stored {
            let validity = inner
                .policy
                .validity(&library, library.cache_time, inner.ctx.clock.now());
            if generation != self.generation() {
                return;
            }
            let cache_time = library.cache_time;
            inner.library.set(Some(CacheState::Loaded { value: library, cache_time }));
            if validity == CacheValidity::Valid {
                return;
            }
        }

        self.sync_library().await;
    }

    /// Fetch the library, reconcile local storage against it and recompute
    /// every live per-entity cell.
    pub async fn sync_library(&self) {
        let inner = &self.inner;
        let generation = self.generation();

        inner.library.update(|current| {
            Some(
                current
                    .as_ref()
                    .map_or_else(CacheState::refreshing, CacheState::to_refreshing),
            )
        });

        let started = inner.ctx.clock.now();
        let fetched = inner.remote.fetch_library().await;
        let finished = inner.ctx.clock.now();
        let fetched_at = started + (finished - started) / 2;

        if generation != self.generation() {
            return;
        }

        let ids = match fetched {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(library = %inner.name, error = %e, "Library refresh failed");
                inner.library.set(Some(CacheState::Error(error::share(e))));
                return;
            }
        };

        let library = Library::new(ids, fetched_at);
        let label = format!("{}: reconcile library", inner.name);
        let reconciled = inner
            .ctx
            .database
            .transaction(&label, || async {
                let previous = inner.store.saved_ids().await?;
                let removed: Vec<String> = previous.difference(&library.ids).cloned().collect();
                let added: Vec<String> = library.ids.difference(&previous).cloned().collect();
                inner
                    .store
                    .replace_library(&library, &removed, &added)
                    .await?;
                Ok::<_, anyhow::Error>((removed.len(), added.len()))
            })
            .await;

        match reconciled {
            Ok((removed, added)) => tracing::info!(
                library = %inner.name,
                count = library.len(),
                removed,
                added,
                "Library refreshed"
            ),
            Err(e) => {
                tracing::warn!(library = %inner.name, error = %e, "Failed to store refreshed library")
            }
        }

        if generation != self.generation() {
            return;
        }

        // in-flight toggles settle on their own
        inner.saved.compute_all_if(|id, current| {
            let saved = library.contains(id);
            match current {
                Some(ToggleableState::Set(v)) if *v == saved => None,
                Some(ToggleableState::TogglingTo(_)) => None,
                _ => Some(Some(ToggleableState::Set(saved))),
            }
        });
        inner.library.set(Some(CacheState::Loaded {
            value: library,
            cache_time: fetched_at,
        }));
    }

    /// Observable saved state of `id`, resolved on first request.
    pub fn saved_state_of(&self, id: &str) -> SavedCell {
        self.inner.saved.get_or_create(
            id,
            || None,
            |_| {
                let this = self.clone();
                let id = id.to_string();
                self.inner
                    .ctx
                    .handle
                    .spawn(async move { this.resolve_saved(&[id]).await });
            },
        )
    }

    pub fn saved_states_of(&self, ids: &[String]) -> Vec<SavedCell> {
        self.inner.saved.get_or_create_batch(
            ids,
            |_| None,
            |created| {
                let this = self.clone();
                let created = created.to_vec();
                self.inner
                    .ctx
                    .handle
                    .spawn(async move { this.resolve_saved(&created).await });
            },
        )
    }

    /// Resolve saved flags: in-memory library first, then local storage, then
    /// one remote membership check for whatever is left.
    pub async fn resolve_saved(&self, ids: &[String]) {
        let inner = &self.inner;
        let generation = self.generation();
        let Some(claim) = inner.checks.claim(ids.iter().map(String::as_str)) else {
            return;
        };
        let mut pending: Vec<String> = claim.keys().to_vec();

        let library = inner
            .library
            .with(|state| state.as_ref().and_then(CacheState::value).cloned());
        if let Some(library) = library {
            for id in &pending {
                self.settle(id, library.contains(id));
            }
            return;
        }

        let label = format!("{}: fetch saved flags", inner.name);
        let stored = inner
            .ctx
            .database
            .transaction(&label, || async {
                match pending.as_slice() {
                    [id] => Ok(vec![inner.store.saved_flag(id).await?]),
                    _ => inner.store.saved_flags(&pending).await,
                }
            })
            .await
            .ok()
            .filter(|flags| flags.len() == pending.len())
            .unwrap_or_else(|| vec![None; pending.len()]);

        if generation != self.generation() {
            return;
        }
        pending = pending
            .into_iter()
            .zip(stored)
            .filter_map(|(id, flag)| match flag {
                Some(flag) => {
                    self.settle(&id, flag.value.saved);
                    None
                }
                None => Some(id),
            })
            .collect();

        if pending.is_empty() {
            return;
        }

        let checked = match inner.remote.contains(&pending).await {
            Ok(checked) if checked.len() == pending.len() => checked,
            Ok(checked) => {
                tracing::warn!(library = %inner.name, expected = pending.len(), got = checked.len(), "Saved check returned wrong number of flags");
                return;
            }
            Err(e) => {
                tracing::warn!(library = %inner.name, error = %e, "Saved check failed");
                return;
            }
        };
        if generation != self.generation() {
            return;
        }

        let now = inner.ctx.clock.now();
        let label = format!("{}: persist saved flags", inner.name);
        let persisted = inner
            .ctx
            .database
            .transaction(&label, || async {
                let flags = pending
                    .iter()
                    .zip(&checked)
                    .map(|(id, saved)| (id.clone(), SavedFlag { saved: *saved, saved_at: None }))
                    .collect();
                inner.store.set_saved_many(flags, now).await
            })
            .await;
        if let Err(e) = persisted {
            tracing::warn!(library = %inner.name, error = %e, "Failed to persist saved flags");
        }

        for (id, saved) in pending.iter().zip(checked) {
            self.settle(id, saved);
        }
    }

    /// Publish a settled flag unless a toggle for `id` is in flight.
    fn settle(&self, id: &str, saved: bool) {
        if let Some(cell) = self.inner.saved.get(id) {
            cell.update_if(|current| match current {
                Some(ToggleableState::TogglingTo(_)) => None,
                Some(ToggleableState::Set(v)) if *v == saved => None,
                _ => Some(Some(ToggleableState::Set(saved))),
            });
        }
    }

    /// Save or unsave `id`, showing the change optimistically.
    ///
    /// On failure the per-entity flag goes back to what it was before the call
    /// and the error is returned. A second change for the same id while one is
    /// in flight is ignored.
    pub async fn set_saved(&self, id: &str, saved: bool) -> Result<()> {
        let inner = &self.inner;
        let Some(_claim) = inner.toggles.claim([id]) else {
            tracing::debug!(library = %inner.name, id, "Saved change already in flight");
            return Ok(());
        };

        let generation = self.generation();
        // hold the cell so the optimistic state stays observable
        let cell = inner.saved.get_or_create(id, || None, |_| {});
        let previous = cell.get();
        cell.set(Some(ToggleableState::TogglingTo(saved)));

        let ids = [id.to_string()];
        let result = if saved {
            inner.remote.save(&ids).await
        } else {
            inner.remote.unsave(&ids).await
        };

        if let Err(e) = result {
            tracing::warn!(library = %inner.name, id, saved, error = %e, "Saved change failed, reverting");
            if generation == self.generation() {
                cell.set(previous.map(|state| ToggleableState::Set(state.value())));
            }
            return Err(e);
        }

        let now = inner.ctx.clock.now();
        let label = format!("{}: set saved", inner.name);
        let flag = SavedFlag {
            saved,
            saved_at: saved.then_some(now),
        };
        let persisted = inner
            .ctx
            .database
            .transaction(&label, || async { inner.store.set_saved(id, flag, now).await })
            .await;
        if let Err(e) = persisted {
            tracing::warn!(library = %inner.name, id, error = %e, "Failed to persist saved flag");
        }

        if generation != self.generation() {
            return Ok(());
        }

        inner.library.update_if(|state| match state {
            Some(CacheState::Loaded { value, cache_time }) if value.contains(id) != saved => {
                let mut library = value.clone();
                if saved {
                    library.ids.insert(id.to_string());
                } else {
                    library.ids.remove(id);
                }
                Some(Some(CacheState::Loaded {
                    value: library,
                    cache_time: *cache_time,
                }))
            }
            _ => None,
        });
        cell.set(Some(ToggleableState::Set(saved)));

        tracing::info!(library = %inner.name, id, saved, "Saved state changed");
        Ok(())
    }

    pub async fn save(&self, id: &str) -> Result<()> {
        self.set_saved(id, true).await
    }

    pub async fn unsave(&self, id: &str) -> Result<()> {
        self.set_saved(id, false).await
    }

    /// Flip the saved state of `id`. An unknown state counts as unsaved.
    pub async fn toggle_saved(&self, id: &str) -> Result<bool> {
        let current = self
            .inner
            .saved
            .get_value(id)
            .flatten()
            .map(|state| state.value())
            .unwrap_or(false);
        self.set_saved(id, !current).await?;
        Ok(!current)
    }

    /// Saved ids currently known, if the library has been loaded.
    pub fn known_saved_ids(&self) -> Option<HashSet<String>> {
        self.inner
            .library
            .with(|state| state.as_ref().and_then(CacheState::value).map(|l| l.ids.clone()))
    }

    /// Forget everything known about the current user. Cells handed out before
    /// stop receiving updates; work still in flight is discarded.
    pub fn invalidate_user(&self) {
        tracing::info!(library = %self.inner.name, "Invalidating saved state for user switch");
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.library.set(None);
        self.inner.saved.clear();
    }
}
