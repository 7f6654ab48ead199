//! # One write operation: state machine, lifecycle callbacks, pausing.
//!
//! A [`Mutation`] drives `idle → pending → (success | error)` through the
//! same Retryer as queries. Lifecycle callbacks layer cache-level hooks
//! before option-level ones, and all of them are awaited before the
//! `execute` promise resolves. Under offline (per network mode) the attempt
//! chain pauses; [`Mutation::continue_`] resumes it preserving failure count
//! and context.

use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EngineError;
use crate::mutation_cache::{MutationCache, MutationCacheEvent};
use crate::notify::notify_manager;
use crate::options::{GcTime, MutationOptions};
use crate::retry::{Retryer, RetryerCallbacks, RetryerConfig, can_fetch};
use crate::rt;

/// Lifecycle of one write operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    /// Not started.
    Idle,
    /// Running (or paused awaiting connectivity).
    Pending,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Error,
}

/// Full state of one mutation.
#[derive(Clone, Debug)]
pub struct MutationState {
    /// Result payload.
    pub data: Option<Arc<Value>>,
    /// Terminal error.
    pub error: Option<Arc<anyhow::Error>>,
    /// Variables the mutation ran with.
    pub variables: Option<Arc<Value>>,
    /// Context returned by `on_mutate`.
    pub context: Option<Arc<Value>>,
    /// Failures of the current attempt chain.
    pub failure_count: u32,
    /// Error of the most recent failed attempt.
    pub failure_reason: Option<Arc<anyhow::Error>>,
    /// Suspended awaiting connectivity or its scope turn.
    pub is_paused: bool,
    /// Lifecycle position.
    pub status: MutationStatus,
    /// Epoch ms when the mutation was submitted (0 = never).
    pub submitted_at: u64,
}

impl Default for MutationState {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            variables: None,
            context: None,
            failure_count: 0,
            failure_reason: None,
            is_paused: false,
            status: MutationStatus::Idle,
            submitted_at: 0,
        }
    }
}

/// Reducer input for one mutation transition.
#[derive(Clone)]
pub enum MutationAction {
    /// The mutation was submitted (possibly re-dispatched with context).
    Pending {
        /// Submitted variables.
        variables: Arc<Value>,
        /// Context from `on_mutate`, when present.
        context: Option<Arc<Value>>,
        /// Whether the chain starts paused.
        is_paused: bool,
    },
    /// An attempt failed but the chain continues.
    Failed {
        /// New failure count.
        failure_count: u32,
        /// The failure.
        error: Arc<anyhow::Error>,
    },
    /// The chain paused awaiting connectivity or its scope turn.
    Pause,
    /// The chain resumed.
    Continue,
    /// Terminal success.
    Success {
        /// The result payload.
        data: Arc<Value>,
    },
    /// Terminal failure.
    Error {
        /// The terminal error.
        error: Arc<anyhow::Error>,
    },
}

impl std::fmt::Debug for MutationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MutationAction::Pending { .. } => "pending",
            MutationAction::Failed { .. } => "failed",
            MutationAction::Pause => "pause",
            MutationAction::Continue => "continue",
            MutationAction::Success { .. } => "success",
            MutationAction::Error { .. } => "error",
        };
        f.write_str(name)
    }
}

/// Internal seam between a mutation and its observers.
pub(crate) trait MutationObserverLink: Send + Sync {
    fn id(&self) -> u64;
    fn on_mutation_update(&self, action: &MutationAction);
}

/// One write operation owned by a [`MutationCache`].
pub struct Mutation {
    mutation_id: u64,
    cache: Weak<MutationCache>,
    weak_self: Weak<Mutation>,
    options: Mutex<Arc<MutationOptions>>,
    state: Mutex<MutationState>,
    observers: Mutex<Vec<Arc<dyn MutationObserverLink>>>,
    retryer: Mutex<Option<Retryer>>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl Mutation {
    pub(crate) fn new(
        cache: Weak<MutationCache>,
        mutation_id: u64,
        options: Arc<MutationOptions>,
        state: Option<MutationState>,
    ) -> Arc<Self> {
        let mutation = Arc::new_cyclic(|weak_self| Self {
            mutation_id,
            cache,
            weak_self: weak_self.clone(),
            options: Mutex::new(options),
            state: Mutex::new(state.unwrap_or_default()),
            observers: Mutex::new(Vec::new()),
            retryer: Mutex::new(None),
            gc_task: Mutex::new(None),
        });
        mutation.schedule_gc();
        mutation
    }

    /// Monotonic id assigned by the cache.
    pub fn mutation_id(&self) -> u64 {
        self.mutation_id
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> MutationState {
        self.state.lock().clone()
    }

    /// Current options.
    pub fn options(&self) -> Arc<MutationOptions> {
        Arc::clone(&self.options.lock())
    }

    /// Scope identifier, when the mutation is scoped.
    pub fn scope_id(&self) -> Option<String> {
        self.options.lock().scope_id.clone()
    }

    /// Number of attached observers.
    pub fn observers_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Runs the mutation to completion, awaiting every lifecycle callback.
    pub async fn execute(
        self: Arc<Self>,
        variables: Value,
    ) -> Result<Arc<Value>, Arc<anyhow::Error>> {
        let variables = Arc::new(variables);
        let opts = self.options();
        let mutation_fn = match &opts.mutation_fn {
            Some(f) => Arc::clone(f),
            None => {
                return Err(Arc::new(anyhow::Error::new(EngineError::MissingMutationFn)));
            }
        };

        let can_run_gate: Arc<dyn Fn() -> bool + Send + Sync> = {
            let weak = self.weak_self.clone();
            let cache = self.cache.clone();
            Arc::new(move || match (weak.upgrade(), cache.upgrade()) {
                (Some(mutation), Some(cache)) => cache.can_run(&mutation),
                _ => true,
            })
        };
        let can_start = can_fetch(opts.network_mode()) && can_run_gate();
        // A paused mutation resumed after restart re-enters here pending.
        let restored = self.state().status == MutationStatus::Pending;

        let attempt = {
            let variables = Arc::clone(&variables);
            Arc::new(move || mutation_fn(Arc::clone(&variables)))
        };
        let weak = self.weak_self.clone();
        let callbacks = RetryerCallbacks {
            on_fail: Some(Box::new({
                let weak = weak.clone();
                move |failure_count, error| {
                    if let Some(m) = weak.upgrade() {
                        m.dispatch(MutationAction::Failed {
                            failure_count,
                            error: Arc::clone(error),
                        });
                    }
                }
            })),
            on_pause: Some(Box::new({
                let weak = weak.clone();
                move || {
                    if let Some(m) = weak.upgrade() {
                        m.dispatch(MutationAction::Pause);
                    }
                }
            })),
            on_continue: Some(Box::new({
                let weak = weak.clone();
                move || {
                    if let Some(m) = weak.upgrade() {
                        m.dispatch(MutationAction::Continue);
                    }
                }
            })),
            ..RetryerCallbacks::default()
        };
        let retryer = Retryer::spawn(
            RetryerConfig {
                fetch_fn: attempt,
                initial_promise: None,
                retry: opts.retry(),
                retry_delay: opts.retry_delay(),
                network_mode: opts.network_mode(),
                can_run: can_run_gate,
                initial_failure_count: self.state().failure_count,
                callbacks,
            },
            CancellationToken::new(),
        );
        *self.retryer.lock() = Some(retryer.clone());

        let cache = self.cache.upgrade();
        let result = async {
            if !restored {
                self.dispatch(MutationAction::Pending {
                    variables: Arc::clone(&variables),
                    context: None,
                    is_paused: !can_start,
                });
                if let Some(cache) = &cache {
                    cache
                        .run_mutate_hook(&variables)
                        .await
                        .map_err(Arc::new)?;
                }
                if let Some(on_mutate) = &opts.on_mutate {
                    let context = on_mutate(Arc::clone(&variables))
                        .await
                        .map_err(Arc::new)?
                        .map(Arc::new);
                    if context.is_some() {
                        self.dispatch(MutationAction::Pending {
                            variables: Arc::clone(&variables),
                            context,
                            is_paused: !can_start,
                        });
                    }
                }
            }

            retryer.start();
            let data = retryer.promise().await?;

            let context = self.state().context.clone();
            if let Some(cache) = &cache {
                cache
                    .run_success_hooks(&data, &variables, &context)
                    .await
                    .map_err(Arc::new)?;
            }
            if let Some(on_success) = &opts.on_success {
                on_success(Arc::clone(&data), Arc::clone(&variables), context.clone())
                    .await
                    .map_err(Arc::new)?;
            }
            if let Some(on_settled) = &opts.on_settled {
                on_settled(
                    Some(Arc::clone(&data)),
                    None,
                    Arc::clone(&variables),
                    context.clone(),
                )
                .await
                .map_err(Arc::new)?;
            }
            self.dispatch(MutationAction::Success {
                data: Arc::clone(&data),
            });
            Ok(data)
        }
        .await;

        let result = match result {
            Ok(data) => Ok(data),
            Err(error) => {
                // The chain may never have started (a callback failed
                // first); settle it so the dormant task winds down.
                retryer.cancel(crate::error::CancelOptions::silent());
                // Best effort: every error-path callback runs even when an
                // earlier one fails.
                let error: Arc<anyhow::Error> = error;
                let context = self.state().context.clone();
                if let Some(cache) = &cache {
                    cache
                        .run_error_hooks(&error, &variables, &context)
                        .await;
                }
                if let Some(on_error) = &opts.on_error {
                    let _ = on_error(Arc::clone(&error), Arc::clone(&variables), context.clone())
                        .await;
                }
                if let Some(on_settled) = &opts.on_settled {
                    let _ = on_settled(None, Some(Arc::clone(&error)), Arc::clone(&variables), context)
                        .await;
                }
                debug!(%error, "mutation failed");
                self.dispatch(MutationAction::Error {
                    error: Arc::clone(&error),
                });
                Err(error)
            }
        };

        if let Some(cache) = &cache {
            cache.run_next(&self);
        }
        if self.observers.lock().is_empty() {
            self.schedule_gc();
        }
        result
    }

    /// Resumes a paused mutation, or re-executes it with its recorded
    /// variables when the original attempt chain is gone (hydration).
    pub fn continue_(self: Arc<Self>) -> BoxFuture<'static, Result<Arc<Value>, Arc<anyhow::Error>>> {
        let retryer = self.retryer.lock().clone();
        match retryer {
            Some(retryer) => {
                retryer.resume();
                async move { retryer.promise().await }.boxed()
            }
            None => {
                let variables = self
                    .state()
                    .variables
                    .as_deref()
                    .cloned()
                    .unwrap_or(Value::Null);
                self.execute(variables).boxed()
            }
        }
    }

    pub(crate) fn add_observer(&self, observer: Arc<dyn MutationObserverLink>) {
        {
            let mut observers = self.observers.lock();
            if observers.iter().any(|o| o.id() == observer.id()) {
                return;
            }
            observers.push(observer);
        }
        if let Some(task) = self.gc_task.lock().take() {
            task.abort();
        }
        if let (Some(cache), Some(mutation)) = (self.cache.upgrade(), self.weak_self.upgrade()) {
            cache.notify(MutationCacheEvent::ObserverAdded { mutation });
        }
    }

    pub(crate) fn remove_observer(&self, id: u64) {
        let emptied = {
            let mut observers = self.observers.lock();
            let before = observers.len();
            observers.retain(|o| o.id() != id);
            before != observers.len() && observers.is_empty()
        };
        if emptied {
            self.schedule_gc();
        }
        if let (Some(cache), Some(mutation)) = (self.cache.upgrade(), self.weak_self.upgrade()) {
            cache.notify(MutationCacheEvent::ObserverRemoved { mutation });
        }
    }

    fn schedule_gc(&self) {
        let mut task = self.gc_task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }
        let GcTime::After(delay) = self.options().gc_time() else {
            return;
        };
        let cache = self.cache.clone();
        let weak = self.weak_self.clone();
        *task = rt::spawn(async move {
            tokio::time::sleep(delay).await;
            if let (Some(cache), Some(mutation)) = (cache.upgrade(), weak.upgrade()) {
                let removable = mutation.observers_count() == 0
                    && mutation.state().status != MutationStatus::Pending;
                if removable {
                    cache.remove(&mutation);
                }
            }
        });
    }

    fn dispatch(&self, action: MutationAction) {
        {
            let mut state = self.state.lock();
            *state = reduce(&state, &action);
        }
        let observers = self.observers.lock().clone();
        let mutation = self.weak_self.upgrade();
        notify_manager().batch(|| {
            for observer in &observers {
                observer.on_mutation_update(&action);
            }
            if let (Some(cache), Some(mutation)) = (self.cache.upgrade(), mutation) {
                cache.notify(MutationCacheEvent::Updated { mutation, action });
            }
        });
    }
}

fn reduce(state: &MutationState, action: &MutationAction) -> MutationState {
    match action {
        MutationAction::Pending {
            variables,
            context,
            is_paused,
        } => MutationState {
            data: None,
            error: None,
            variables: Some(Arc::clone(variables)),
            context: context.clone(),
            failure_count: 0,
            failure_reason: None,
            is_paused: *is_paused,
            status: MutationStatus::Pending,
            submitted_at: rt::now_ms(),
        },
        MutationAction::Failed {
            failure_count,
            error,
        } => {
            let mut next = state.clone();
            next.failure_count = *failure_count;
            next.failure_reason = Some(Arc::clone(error));
            next
        }
        MutationAction::Pause => {
            let mut next = state.clone();
            next.is_paused = true;
            next
        }
        MutationAction::Continue => {
            let mut next = state.clone();
            next.is_paused = false;
            next
        }
        MutationAction::Success { data } => {
            let mut next = state.clone();
            next.data = Some(Arc::clone(data));
            next.error = None;
            next.is_paused = false;
            next.status = MutationStatus::Success;
            next
        }
        MutationAction::Error { error } => {
            let mut next = state.clone();
            next.error = Some(Arc::clone(error));
            next.failure_count = state.failure_count + 1;
            next.failure_reason = Some(Arc::clone(error));
            next.is_paused = false;
            next.status = MutationStatus::Error;
            next
        }
    }
}

impl std::fmt::Debug for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mutation")
            .field("mutation_id", &self.mutation_id)
            .field("status", &state.status)
            .field("is_paused", &state.is_paused)
            .field("scope_id", &self.options.lock().scope_id)
            .finish_non_exhaustive()
    }
}
