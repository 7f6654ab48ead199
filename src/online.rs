//! # Network-connectivity reactivity.
//!
//! [`OnlineManager`] publishes boolean online transitions. Retryers gated on
//! [`NetworkMode::Online`](crate::retry::NetworkMode) pause while offline
//! and resume on reconnect; caches refetch per observer policy.
//!
//! The platform event source is pluggable the same way as
//! [`FocusManager`](crate::focus::FocusManager): installed by the first
//! subscriber, torn down after the last. Without a source the manager
//! reports online.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::focus::Teardown;
use crate::listeners::{Listeners, Subscription};

/// Callback handed to the platform setup function.
pub type SetOnline = Arc<dyn Fn(bool) + Send + Sync>;

/// Installs platform listeners and returns their teardown.
pub type OnlineSetupFn = Arc<dyn Fn(SetOnline) -> Option<Teardown> + Send + Sync>;

type OnlineListener = dyn Fn(bool) + Send + Sync;

/// Publishes online transitions; process-wide singleton.
pub struct OnlineManager {
    online: Mutex<bool>,
    listeners: Listeners<OnlineListener>,
    setup: Mutex<OnlineSetupFn>,
    teardown: Mutex<Option<Teardown>>,
}

static ONLINE_MANAGER: OnceLock<OnlineManager> = OnceLock::new();

/// Process-wide online manager.
pub fn online_manager() -> &'static OnlineManager {
    ONLINE_MANAGER.get_or_init(OnlineManager::new)
}

impl OnlineManager {
    fn new() -> Self {
        Self {
            online: Mutex::new(true),
            listeners: Listeners::new(),
            setup: Mutex::new(Arc::new(|_set| None)),
            teardown: Mutex::new(None),
        }
    }

    /// Subscribes to online transitions. The first subscriber installs the
    /// platform event source.
    pub fn subscribe(
        &'static self,
        listener: impl Fn(bool) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.listeners.subscribe(Arc::new(listener));
        if self.listeners.len() == 1 {
            self.install();
        }
        Subscription::new(move || {
            self.listeners.unsubscribe(id);
            if !self.listeners.has_listeners() {
                self.teardown();
            }
        })
    }

    /// Swaps the platform event source, tearing down the previous one.
    pub fn set_event_listener(&'static self, setup: OnlineSetupFn) {
        self.teardown();
        *self.setup.lock() = setup;
        if self.listeners.has_listeners() {
            self.install();
        }
    }

    /// Sets connectivity. Listeners fire only on transitions.
    pub fn set_online(&self, online: bool) {
        let changed = {
            let mut current = self.online.lock();
            let changed = *current != online;
            *current = online;
            changed
        };
        if changed {
            for listener in self.listeners.snapshot() {
                listener(online);
            }
        }
    }

    /// Current connectivity state.
    pub fn is_online(&self) -> bool {
        *self.online.lock()
    }

    fn install(&'static self) {
        let setup = self.setup.lock().clone();
        let set: SetOnline = Arc::new(|online| online_manager().set_online(online));
        *self.teardown.lock() = setup(set);
    }

    fn teardown(&self) {
        if let Some(teardown) = self.teardown.lock().take() {
            teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn defaults_to_online() {
        let m = OnlineManager::new();
        assert!(m.is_online());
    }

    #[test]
    fn emits_only_on_transitions() {
        let m = OnlineManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        m.listeners.subscribe(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        m.set_online(true);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        m.set_online(false);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        m.set_online(false);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        m.set_online(true);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
