//! Single-value reactive holder backed by a `watch` channel

use std::fmt;

use tokio::sync::watch;

/// Observable state cell.
///
/// Reads never wait on async work. Writes replace the value atomically and wake
/// every subscriber.
pub struct Observable<V> {
    tx: watch::Sender<V>,
}

impl<V> Observable<V> {
    pub fn new(value: V) -> Self {
        let (tx, _rx) = watch::channel(value);
        Self { tx }
    }

    pub fn get(&self) -> V
    where
        V: Clone,
    {
        self.tx.borrow().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&V) -> R) -> R {
        f(&self.tx.borrow())
    }

    pub fn set(&self, value: V) {
        self.tx.send_replace(value);
    }

    /// Replace the value with `f(current)`.
    pub fn update(&self, f: impl FnOnce(&V) -> V) {
        self.tx.send_modify(|current| {
            let next = f(current);
            *current = next;
        });
    }

    /// Replace the value only if `f` returns a new one; subscribers are woken
    /// only in that case.
    pub fn update_if(&self, f: impl FnOnce(&V) -> Option<V>) -> bool {
        self.tx.send_if_modified(|current| match f(current) {
            Some(next) => {
                *current = next;
                true
            }
            None => false,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<V> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<V: Default> Default for Observable<V> {
    fn default() -> Self {
        Self::new(V::default())
    }
}

impl<V: fmt::Debug> fmt::Debug for Observable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Observable").field(&*self.tx.borrow()).finish()
    }
}
