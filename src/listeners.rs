//! # Listener registry shared by every publisher in the engine.
//!
//! [`Listeners`] is the subscription base under the managers, caches, and
//! observers: it holds a set of callback listeners, hands out monotonic ids,
//! and exposes [`Listeners::has_listeners`] so embedding types can wire
//! platform event sources lazily (install on first subscriber, tear down
//! after the last).
//!
//! Public surfaces wrap an id in a [`Subscription`] guard whose
//! `unsubscribe` is idempotent and which also fires on drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Set of subscribed listeners with stable ids.
pub struct Listeners<L: ?Sized> {
    entries: Mutex<Vec<(u64, Arc<L>)>>,
    seq: AtomicU64,
}

impl<L: ?Sized> Listeners<L> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Inserts a listener and returns its id.
    pub(crate) fn subscribe(&self, listener: Arc<L>) -> u64 {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, listener));
        id
    }

    /// Removes a listener by id. Returns whether it was present.
    pub(crate) fn unsubscribe(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub(crate) fn has_listeners(&self) -> bool {
        !self.entries.lock().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Snapshot of current listeners, safe to iterate without holding locks.
    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard returned by every `subscribe` in the engine.
///
/// Unsubscribes explicitly via [`Subscription::unsubscribe`] or implicitly
/// when dropped; both paths are idempotent.
pub struct Subscription {
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// Removes the listener this guard was created for.
    pub fn unsubscribe(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}
