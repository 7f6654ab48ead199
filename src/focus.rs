//! # Window-focus reactivity.
//!
//! [`FocusManager`] publishes boolean focus transitions to the rest of the
//! engine: paused fetches resume and focus-refetch policies fire when the
//! application regains focus.
//!
//! The platform event source is pluggable. The first subscriber installs the
//! configured setup function (which would hook visibility events in a
//! windowed host); the teardown it returns runs after the last unsubscribe.
//! In headless environments no source is installed and the manager reports
//! focused.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::listeners::{Listeners, Subscription};

/// Teardown returned by a setup function.
pub type Teardown = Box<dyn FnOnce() + Send>;

/// Callback handed to the platform setup function; invoke it with
/// `Some(focused)` on focus events or `None` to re-derive the default.
pub type SetFocused = Arc<dyn Fn(Option<bool>) + Send + Sync>;

/// Installs platform listeners and returns their teardown.
pub type FocusSetupFn = Arc<dyn Fn(SetFocused) -> Option<Teardown> + Send + Sync>;

type FocusListener = dyn Fn(bool) + Send + Sync;

/// Publishes focus transitions; process-wide singleton.
pub struct FocusManager {
    focused: Mutex<Option<bool>>,
    listeners: Listeners<FocusListener>,
    setup: Mutex<FocusSetupFn>,
    teardown: Mutex<Option<Teardown>>,
}

static FOCUS_MANAGER: OnceLock<FocusManager> = OnceLock::new();

/// Process-wide focus manager.
pub fn focus_manager() -> &'static FocusManager {
    FOCUS_MANAGER.get_or_init(FocusManager::new)
}

impl FocusManager {
    fn new() -> Self {
        Self {
            focused: Mutex::new(None),
            listeners: Listeners::new(),
            // Headless default: no platform source.
            setup: Mutex::new(Arc::new(|_set| None)),
            teardown: Mutex::new(None),
        }
    }

    /// Subscribes to focus transitions. The first subscriber installs the
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
    pub fn set_event_listener(&'static self, setup: FocusSetupFn) {
        self.teardown();
        *self.setup.lock() = setup;
        if self.listeners.has_listeners() {
            self.install();
        }
    }

    /// Sets the focus state. `None` re-derives from the platform default
    /// (focused, when no source is installed). Listeners fire only on
    /// transitions of the effective value.
    pub fn set_focused(&self, focused: Option<bool>) {
        let changed = {
            let mut current = self.focused.lock();
            let before = current.unwrap_or(true);
            *current = focused;
            let after = current.unwrap_or(true);
            before != after
        };
        if changed {
            let now = self.is_focused();
            for listener in self.listeners.snapshot() {
                listener(now);
            }
        }
    }

    /// Current effective focus state.
    pub fn is_focused(&self) -> bool {
        self.focused.lock().unwrap_or(true)
    }

    fn install(&'static self) {
        let setup = self.setup.lock().clone();
        let set: SetFocused = Arc::new(|focused| focus_manager().set_focused(focused));
        *self.teardown.lock() = setup(set);
    }

    fn teardown(&self) {
        if let Some(teardown) = self.teardown.lock().take() {
            teardown();
        }
    }
}
