//! Registry of observable cells held weakly by string key
//!
//! Cells stay in the map only while somebody outside the map holds an `Arc` to
//! them. A dropped cell is purged on the next structural operation, and asking
//! for its key again creates a fresh cell (and runs the creation hook again).

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::observable::Observable;

pub type Cell<V> = Arc<Observable<V>>;

pub struct WeakObservableMap<V> {
    entries: Mutex<HashMap<String, Weak<Observable<V>>>>,
}

impl<V> Default for WeakObservableMap<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> WeakObservableMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Weak<Observable<V>>>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Existing cell for `key`, or a new one holding `default()`.
    ///
    /// `on_create` runs exactly once per created cell, after the map lock is
    /// released.
    pub fn get_or_create(
        &self,
        key: &str,
        default: impl FnOnce() -> V,
        on_create: impl FnOnce(&Cell<V>),
    ) -> Cell<V> {
        let (cell, created) = {
            let mut entries = self.entries();
            match entries.entry(key.to_string()) {
                Entry::Occupied(mut occupied) => match occupied.get().upgrade() {
                    Some(cell) => (cell, false),
                    None => {
                        let cell = Arc::new(Observable::new(default()));
                        occupied.insert(Arc::downgrade(&cell));
                        (cell, true)
                    }
                },
                Entry::Vacant(vacant) => {
                    let cell = Arc::new(Observable::new(default()));
                    vacant.insert(Arc::downgrade(&cell));
                    (cell, true)
                }
            }
        };

        if created {
            on_create(&cell);
        }
        cell
    }

    /// Batch form of [`get_or_create`](Self::get_or_create).
    ///
    /// Cells come back in the order of `keys`, duplicates included. `on_create`
    /// is called once with the keys that were newly created, in first-seen
    /// order, and not at all when every key already existed.
    pub fn get_or_create_batch(
        &self,
        keys: &[String],
        mut default: impl FnMut(&str) -> V,
        on_create: impl FnOnce(&[String]),
    ) -> Vec<Cell<V>> {
        let mut created = Vec::new();
        let cells = {
            let mut entries = self.entries();
            entries.retain(|_, weak| weak.strong_count() > 0);

            keys.iter()
                .map(|key| {
                    if let Some(cell) = entries.get(key).and_then(Weak::upgrade) {
                        return cell;
                    }
                    let cell = Arc::new(Observable::new(default(key)));
                    entries.insert(key.clone(), Arc::downgrade(&cell));
                    created.push(key.clone());
                    cell
                })
                .collect::<Vec<_>>()
        };

        if !created.is_empty() {
            on_create(&created);
        }
        cells
    }

    /// The live cell for `key`, without creating one.
    pub fn get(&self, key: &str) -> Option<Cell<V>> {
        self.entries().get(key).and_then(Weak::upgrade)
    }

    pub fn get_value(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        self.get(key).map(|cell| cell.get())
    }

    /// Replace the value for `key`. Absent or reclaimed keys are ignored.
    pub fn update(&self, key: &str, value: V) {
        if let Some(cell) = self.get(key) {
            cell.set(value);
        }
    }

    /// Transform the value for `key`. Absent or reclaimed keys are ignored.
    pub fn update_with(&self, key: &str, f: impl FnOnce(&V) -> V) {
        if let Some(cell) = self.get(key) {
            cell.update(f);
        }
    }

    /// Apply `f` to every live entry. Entries whose cells were dropped are purged.
    pub fn compute_all(&self, mut f: impl FnMut(&str, &V) -> V) {
        for (key, cell) in self.live_entries() {
            cell.update(|value| f(&key, value));
        }
    }

    /// Like [`compute_all`](Self::compute_all), but `f` returns `None` to leave a
    /// value (and its subscribers) untouched.
    pub fn compute_all_if(&self, mut f: impl FnMut(&str, &V) -> Option<V>) {
        for (key, cell) in self.live_entries() {
            cell.update_if(|value| f(&key, value));
        }
    }

    pub fn live_entries(&self) -> Vec<(String, Cell<V>)> {
        let mut entries = self.entries();
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries
            .iter()
            .filter_map(|(key, weak)| weak.upgrade().map(|cell| (key.clone(), cell)))
            .collect()
    }

    pub fn live_len(&self) -> usize {
        self.entries()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Drop every reference the map holds. Cells still held elsewhere keep
    /// working but are no longer reachable through the map.
    pub fn clear(&self) {
        self.entries().clear();
    }
}
