//! # Per-subscription view over mutations.
//!
//! A [`MutationObserver`] fronts the mutation cache for one call site:
//! [`MutationObserver::mutate`] builds a fresh [`Mutation`], subscribes to
//! its transitions, and resolves once every lifecycle callback ran.
//! Call-site callbacks layer over observer options, which layer over cache
//! defaults.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use crate::client::QueryClient;
use crate::listeners::{Listeners, Subscription};
use crate::mutation::{Mutation, MutationAction, MutationObserverLink, MutationState, MutationStatus};
use crate::mutation_cache::MutationCacheEvent;
use crate::notify::notify_manager;
use crate::options::MutationOptions;

/// Derived result exposed to adapters.
#[derive(Clone, Debug, Default)]
pub struct MutationObserverResult {
    /// Result payload.
    pub data: Option<Arc<Value>>,
    /// Terminal error.
    pub error: Option<Arc<anyhow::Error>>,
    /// Variables of the current mutation.
    pub variables: Option<Arc<Value>>,
    /// Context from `on_mutate`.
    pub context: Option<Arc<Value>>,
    /// Lifecycle position; `None` when no mutation ran yet.
    pub status: Option<MutationStatus>,
    /// Suspended awaiting connectivity or its scope turn.
    pub is_paused: bool,
    /// Failures of the current attempt chain.
    pub failure_count: u32,
    /// Error of the most recent failed attempt.
    pub failure_reason: Option<Arc<anyhow::Error>>,
    /// Epoch ms when the mutation was submitted.
    pub submitted_at: u64,
}

impl MutationObserverResult {
    pub fn is_idle(&self) -> bool {
        matches!(self.status, None | Some(MutationStatus::Idle))
    }

    pub fn is_pending(&self) -> bool {
        self.status == Some(MutationStatus::Pending)
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(MutationStatus::Success)
    }

    pub fn is_error(&self) -> bool {
        self.status == Some(MutationStatus::Error)
    }

    fn from_state(state: &MutationState) -> Self {
        Self {
            data: state.data.clone(),
            error: state.error.clone(),
            variables: state.variables.clone(),
            context: state.context.clone(),
            status: Some(state.status),
            is_paused: state.is_paused,
            failure_count: state.failure_count,
            failure_reason: state.failure_reason.clone(),
            submitted_at: state.submitted_at,
        }
    }
}

/// Call-site callbacks passed to one `mutate` invocation.
#[derive(Clone, Default)]
pub struct MutateCallbacks {
    /// Runs after success, after cache and option layers.
    pub on_success: Option<Arc<dyn Fn(&Arc<Value>, &Arc<Value>, &Option<Arc<Value>>) + Send + Sync>>,
    /// Runs after failure, after cache and option layers.
    pub on_error:
        Option<Arc<dyn Fn(&Arc<anyhow::Error>, &Arc<Value>, &Option<Arc<Value>>) + Send + Sync>>,
    /// Runs after either outcome.
    pub on_settled: Option<
        Arc<
            dyn Fn(Option<&Arc<Value>>, Option<&Arc<anyhow::Error>>, &Arc<Value>, &Option<Arc<Value>>)
                + Send
                + Sync,
        >,
    >,
}

type MutationListener = dyn Fn(&MutationObserverResult) + Send + Sync;

fn next_observer_id() -> u64 {
    static MUTATION_OBSERVER_SEQ: OnceLock<AtomicU64> = OnceLock::new();
    MUTATION_OBSERVER_SEQ
        .get_or_init(|| AtomicU64::new(1))
        .fetch_add(1, Ordering::Relaxed)
}

/// Subscription point over mutations built through one client.
pub struct MutationObserver {
    id: u64,
    client: Arc<QueryClient>,
    weak_self: Weak<MutationObserver>,
    options: Mutex<Arc<MutationOptions>>,
    current_mutation: Mutex<Option<Arc<Mutation>>>,
    current_result: Mutex<MutationObserverResult>,
    mutate_callbacks: Mutex<Option<MutateCallbacks>>,
    listeners: Listeners<MutationListener>,
    notify_pending: AtomicBool,
}

impl MutationObserver {
    /// Creates an observer with resolved mutation options.
    pub fn new(client: &Arc<QueryClient>, options: MutationOptions) -> Arc<Self> {
        let options = client.default_mutation_options(options);
        Arc::new_cyclic(|weak_self| Self {
            id: next_observer_id(),
            client: Arc::clone(client),
            weak_self: weak_self.clone(),
            options: Mutex::new(options),
            current_mutation: Mutex::new(None),
            current_result: Mutex::new(MutationObserverResult::default()),
            mutate_callbacks: Mutex::new(None),
            listeners: Listeners::new(),
            notify_pending: AtomicBool::new(false),
        })
    }

    /// Current options.
    pub fn options(&self) -> Arc<MutationOptions> {
        Arc::clone(&self.options.lock())
    }

    /// Re-resolves options; also applied to the current mutation.
    pub fn set_options(&self, options: MutationOptions) {
        let options = self.client.default_mutation_options(options);
        *self.options.lock() = Arc::clone(&options);
        if let Some(mutation) = self.current_mutation.lock().clone() {
            self.client
                .mutation_cache()
                .notify(MutationCacheEvent::ObserverOptionsUpdated { mutation });
        }
    }

    /// Latest derived result.
    pub fn get_current_result(&self) -> MutationObserverResult {
        self.current_result.lock().clone()
    }

    /// Subscribes a listener to result transitions.
    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationObserverResult) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.listeners.subscribe(Arc::new(listener));
        let weak = self.weak_self.clone();
        Subscription::new(move || {
            if let Some(observer) = weak.upgrade() {
                observer.listeners.unsubscribe(id);
            }
        })
    }

    /// Builds and executes a fresh mutation with `variables`.
    pub fn mutate(
        &self,
        variables: Value,
        callbacks: Option<MutateCallbacks>,
    ) -> impl Future<Output = Result<Arc<Value>, Arc<anyhow::Error>>> + Send + 'static {
        *self.mutate_callbacks.lock() = callbacks;

        if let Some(previous) = self.current_mutation.lock().take() {
            previous.remove_observer(self.id);
        }
        let mutation = self
            .client
            .mutation_cache()
            .build(self.options(), None);
        if let Some(link) = self.weak_self.upgrade() {
            mutation.add_observer(link as Arc<dyn MutationObserverLink>);
        }
        *self.current_mutation.lock() = Some(Arc::clone(&mutation));
        self.update_result();

        mutation.execute(variables)
    }

    /// Detaches from the current mutation and returns to the idle result.
    pub fn reset(&self) {
        if let Some(mutation) = self.current_mutation.lock().take() {
            mutation.remove_observer(self.id);
        }
        *self.mutate_callbacks.lock() = None;
        self.update_result();
    }

    fn update_result(&self) {
        let next = match self.current_mutation.lock().clone() {
            Some(mutation) => MutationObserverResult::from_state(&mutation.state()),
            None => MutationObserverResult::default(),
        };
        *self.current_result.lock() = next;
        self.notify_listeners();
    }

    fn notify_listeners(&self) {
        if !self.notify_pending.swap(true, Ordering::SeqCst) {
            let weak = self.weak_self.clone();
            notify_manager().schedule(Box::new(move || {
                if let Some(observer) = weak.upgrade() {
                    observer.notify_pending.store(false, Ordering::SeqCst);
                    let result = observer.get_current_result();
                    for listener in observer.listeners.snapshot() {
                        listener(&result);
                    }
                }
            }));
        }
    }

    fn run_mutate_callbacks(&self, action: &MutationAction) {
        let callbacks = self.mutate_callbacks.lock().clone();
        let Some(callbacks) = callbacks else {
            return;
        };
        if !self.listeners.has_listeners() {
            return;
        }
        let result = self.get_current_result();
        let Some(variables) = result.variables.clone() else {
            return;
        };
        match action {
            MutationAction::Success { data } => {
                if let Some(on_success) = &callbacks.on_success {
                    on_success(data, &variables, &result.context);
                }
                if let Some(on_settled) = &callbacks.on_settled {
                    on_settled(Some(data), None, &variables, &result.context);
                }
            }
            MutationAction::Error { error } => {
                if let Some(on_error) = &callbacks.on_error {
                    on_error(error, &variables, &result.context);
                }
                if let Some(on_settled) = &callbacks.on_settled {
                    on_settled(None, Some(error), &variables, &result.context);
                }
            }
            _ => {}
        }
    }
}

impl MutationObserverLink for MutationObserver {
    fn id(&self) -> u64 {
        self.id
    }

    fn on_mutation_update(&self, action: &MutationAction) {
        self.update_result();
        notify_manager().batch(|| {
            self.run_mutate_callbacks(action);
        });
    }
}

impl std::fmt::Debug for MutationObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationObserver")
            .field("id", &self.id)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}
