//! # One cached entry: state machine, fetch orchestration, gc.
//!
//! A [`Query`] owns the state for one cache key and drives fetches through a
//! [`Retryer`]. All state transitions flow through a pure reducer over
//! [`QueryAction`]s; notifications (observer fan-out plus the cache event
//! stream) happen after the transition, inside a notification batch.
//!
//! ## Event flow
//! ```text
//! fetch()
//!   ├─► single-flight: join the live promise, or cancel-and-replace
//!   ├─► snapshot state (revert point)
//!   ├─► dispatch Fetch (fetching | paused)
//!   └─► Retryer ──► on_fail / on_pause / on_continue ──► dispatch
//!                ├─► on_success → structural sharing → dispatch Success
//!                └─► on_error   → dispatch Error (or revert on cancel)
//! ```
//!
//! ## Rules
//! - At most one Retryer is live per query.
//! - A gc timer runs exactly while the observer set is empty.
//! - A cancelled fetch with `revert` restores the pre-fetch snapshot;
//!   `silent` suppresses the transition entirely.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{CancelOptions, EngineError, cancelled};
use crate::key::QueryKey;
use crate::notify::notify_manager;
use crate::options::{
    BehaviorContext, FetchOptions, GcTime, QueryFnContext, QueryFunction, QueryOptions,
};
use crate::query_cache::{QueryCache, QueryCacheEvent};
use crate::retry::{FetchResult, Retryer, RetryerCallbacks, RetryerConfig, can_fetch};
use crate::rt;

/// Outcome axis of a query: has it ever produced data or an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// No data and no error yet.
    Pending,
    /// The last settled outcome was an error.
    Error,
    /// Data is present.
    Success,
}

/// Execution axis of a query: what the fetch pipeline is doing right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    /// Nothing in flight.
    Idle,
    /// An attempt chain is running.
    Fetching,
    /// The attempt chain is suspended awaiting focus/connectivity.
    Paused,
}

/// Full state of one cached query.
#[derive(Clone, Debug)]
pub struct QueryState {
    /// Cached payload.
    pub data: Option<Arc<Value>>,
    /// Epoch ms of the last successful data write (0 = never).
    pub data_updated_at: u64,
    /// Last settled error.
    pub error: Option<Arc<anyhow::Error>>,
    /// Epoch ms of the last error (0 = never).
    pub error_updated_at: u64,
    /// Failures of the current/last attempt chain.
    pub fetch_failure_count: u32,
    /// Error of the most recent failed attempt.
    pub fetch_failure_reason: Option<Arc<anyhow::Error>>,
    /// Meta recorded for the in-flight fetch.
    pub fetch_meta: Option<Arc<Value>>,
    /// Marked stale regardless of age.
    pub is_invalidated: bool,
    /// Outcome axis.
    pub status: QueryStatus,
    /// Execution axis.
    pub fetch_status: FetchStatus,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            data: None,
            data_updated_at: 0,
            error: None,
            error_updated_at: 0,
            fetch_failure_count: 0,
            fetch_failure_reason: None,
            fetch_meta: None,
            is_invalidated: false,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
        }
    }
}

impl QueryState {
    fn from_options(options: &QueryOptions) -> Self {
        match &options.initial_data {
            Some(data) => Self {
                data: Some(Arc::new(data.clone())),
                data_updated_at: options.initial_data_updated_at.unwrap_or_else(rt::now_ms),
                status: QueryStatus::Success,
                ..Self::default()
            },
            None => Self::default(),
        }
    }
}

/// Reducer input for one state transition.
#[derive(Clone)]
pub enum QueryAction {
    /// A fetch started.
    Fetch {
        /// Meta recorded on the fetch.
        meta: Option<Arc<Value>>,
    },
    /// An attempt failed but the chain continues.
    Failed {
        /// New failure count.
        failure_count: u32,
        /// The failure.
        error: Arc<anyhow::Error>,
    },
    /// The attempt chain paused awaiting focus/connectivity.
    Pause,
    /// The attempt chain resumed.
    Continue,
    /// The fetch (or a manual write) produced data.
    Success {
        /// Payload after structural sharing.
        data: Arc<Value>,
        /// Explicit timestamp; now when absent.
        data_updated_at: Option<u64>,
        /// Whether this was a manual write rather than a fetch result.
        manual: bool,
    },
    /// The attempt chain settled with an error.
    Error {
        /// The terminal error.
        error: Arc<anyhow::Error>,
    },
    /// The entry was marked stale.
    Invalidate,
    /// Wholesale state replacement (reset, revert, hydration).
    SetState {
        /// The replacement state.
        state: QueryState,
    },
}

impl std::fmt::Debug for QueryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QueryAction::Fetch { .. } => "fetch",
            QueryAction::Failed { .. } => "failed",
            QueryAction::Pause => "pause",
            QueryAction::Continue => "continue",
            QueryAction::Success { .. } => "success",
            QueryAction::Error { .. } => "error",
            QueryAction::Invalidate => "invalidate",
            QueryAction::SetState { .. } => "setState",
        };
        f.write_str(name)
    }
}

/// Internal seam between a query and its observers.
pub(crate) trait QueryObserverLink: Send + Sync {
    fn id(&self) -> u64;
    fn on_query_update(&self, action: &QueryAction);
    fn should_fetch_on_window_focus(&self) -> bool;
    fn should_fetch_on_reconnect(&self) -> bool;
    /// Fire-and-forget refetch joining any in-flight fetch.
    fn trigger_refetch(&self);
    fn is_enabled(&self) -> bool;
    fn is_stale(&self) -> bool;
}

/// One cached entry.
pub struct Query {
    query_key: QueryKey,
    query_hash: String,
    cache: Weak<QueryCache>,
    weak_self: Weak<Query>,
    options: Mutex<Arc<QueryOptions>>,
    state: Mutex<QueryState>,
    initial_state: QueryState,
    revert_state: Mutex<Option<QueryState>>,
    observers: Mutex<Vec<Arc<dyn QueryObserverLink>>>,
    retryer: Mutex<Option<Retryer>>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl Query {
    pub(crate) fn new(
        cache: Weak<QueryCache>,
        options: Arc<QueryOptions>,
        state: Option<QueryState>,
    ) -> Arc<Self> {
        let query_hash = options.hash();
        let initial_state = state.unwrap_or_else(|| QueryState::from_options(&options));
        let query = Arc::new_cyclic(|weak_self| Self {
            query_key: options.query_key.clone(),
            query_hash,
            cache,
            weak_self: weak_self.clone(),
            options: Mutex::new(options),
            state: Mutex::new(initial_state.clone()),
            initial_state,
            revert_state: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
            retryer: Mutex::new(None),
            gc_task: Mutex::new(None),
        });
        // Entries built without an observer head straight into gc.
        query.schedule_gc();
        query
    }

    /// The key identifying this entry.
    pub fn query_key(&self) -> &QueryKey {
        &self.query_key
    }

    /// Canonical hash of the key.
    pub fn query_hash(&self) -> &str {
        &self.query_hash
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> QueryState {
        self.state.lock().clone()
    }

    /// Current options.
    pub fn options(&self) -> Arc<QueryOptions> {
        Arc::clone(&self.options.lock())
    }

    pub(crate) fn set_options(&self, options: Arc<QueryOptions>) {
        *self.options.lock() = options;
    }

    /// Number of attached observers.
    pub fn observers_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Whether any attached observer is enabled.
    pub fn is_active(&self) -> bool {
        self.observers.lock().iter().any(|o| o.is_enabled())
    }

    /// Observed but with every observer disabled.
    pub fn is_disabled(&self) -> bool {
        self.observers_count() > 0 && !self.is_active()
    }

    /// Whether this entry counts as stale right now.
    pub fn is_stale(&self) -> bool {
        let observers = self.observers.lock().clone();
        if !observers.is_empty() {
            return observers.iter().any(|o| o.is_stale());
        }
        let state = self.state.lock();
        state.is_invalidated || state.data.is_none()
    }

    /// Staleness against an explicit age threshold.
    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        let state = self.state.lock();
        if state.is_invalidated || state.data_updated_at == 0 {
            return true;
        }
        if stale_time == Duration::MAX {
            return false;
        }
        let age = rt::now_ms().saturating_sub(state.data_updated_at) as u128;
        age >= stale_time.as_millis()
    }

    /// Marks the entry stale. Does not fetch.
    pub fn invalidate(&self) {
        if !self.state.lock().is_invalidated {
            trace!(query = %self.query_hash, "invalidated");
            self.dispatch(QueryAction::Invalidate);
        }
    }

    /// Starts (or joins) a fetch. The returned future resolves with this
    /// attempt chain's outcome.
    pub(crate) fn fetch(
        &self,
        options: Option<Arc<QueryOptions>>,
        fetch_options: Option<FetchOptions>,
    ) -> BoxFuture<'static, FetchResult> {
        // Single flight: join the live chain unless told to replace it.
        {
            let fetch_status = self.state.lock().fetch_status;
            if fetch_status != FetchStatus::Idle {
                let live = self.retryer.lock().clone();
                if let Some(retryer) = live {
                    let cancel_refetch =
                        fetch_options.as_ref().is_some_and(|o| o.cancel_refetch);
                    let has_data = self.state.lock().data.is_some();
                    if cancel_refetch && has_data {
                        retryer.cancel(CancelOptions::silent());
                    } else {
                        retryer.continue_retry();
                        return retryer.promise().boxed();
                    }
                }
            }
        }

        if let Some(options) = options {
            self.set_options(options);
        }
        let opts = self.options();

        let query_fn = match &opts.query_fn {
            Some(QueryFunction::Fetch(f)) => Arc::clone(f),
            Some(QueryFunction::Skip) => {
                let err = Arc::new(anyhow::Error::new(EngineError::SkippedQueryFn {
                    query_hash: self.query_hash.clone(),
                }));
                return futures::future::ready(Err(err)).boxed();
            }
            None => {
                let err = Arc::new(anyhow::Error::new(EngineError::MissingQueryFn {
                    query_hash: self.query_hash.clone(),
                }));
                return futures::future::ready(Err(err)).boxed();
            }
        };

        // Snapshot for a possible revert on cancellation.
        *self.revert_state.lock() = Some(self.state.lock().clone());

        let signal = CancellationToken::new();
        let meta = fetch_options
            .as_ref()
            .and_then(|o| o.meta.clone())
            .or_else(|| opts.meta.clone());
        let direction = fetch_options.as_ref().and_then(|o| o.direction);

        let attempt = self.build_attempt(&opts, query_fn, &signal, &meta, direction);

        debug!(query = %self.query_hash, "fetch started");
        self.dispatch(QueryAction::Fetch { meta });

        let weak = self.weak_self.clone();
        let callbacks = RetryerCallbacks {
            on_success: Some(Box::new({
                let weak = weak.clone();
                move |data| {
                    if let Some(query) = weak.upgrade() {
                        query.on_fetch_success(data);
                    }
                }
            })),
            on_error: Some(Box::new({
                let weak = weak.clone();
                move |error| {
                    if let Some(query) = weak.upgrade() {
                        query.on_fetch_error(error);
                    }
                }
            })),
            on_fail: Some(Box::new({
                let weak = weak.clone();
                move |failure_count, error| {
                    if let Some(query) = weak.upgrade() {
                        query.dispatch(QueryAction::Failed {
                            failure_count,
                            error: Arc::clone(error),
                        });
                    }
                }
            })),
            on_pause: Some(Box::new({
                let weak = weak.clone();
                move || {
                    if let Some(query) = weak.upgrade() {
                        query.dispatch(QueryAction::Pause);
                    }
                }
            })),
            on_continue: Some(Box::new({
                let weak = weak.clone();
                move || {
                    if let Some(query) = weak.upgrade() {
                        query.dispatch(QueryAction::Continue);
                    }
                }
            })),
        };

        let retryer = Retryer::spawn(
            RetryerConfig {
                fetch_fn: attempt,
                initial_promise: None,
                retry: opts.retry(),
                retry_delay: opts.retry_delay(),
                network_mode: opts.network_mode(),
                can_run: Arc::new(|| true),
                initial_failure_count: 0,
                callbacks,
            },
            signal,
        );
        *self.retryer.lock() = Some(retryer.clone());
        retryer.start();

        let promise = retryer.promise();
        let weak = self.weak_self.clone();
        async move {
            match promise.await {
                // Expose the stored payload so callers observe the same
                // identity structural sharing settled on.
                Ok(value) => Ok(weak
                    .upgrade()
                    .and_then(|q| q.state.lock().data.clone())
                    .unwrap_or(value)),
                Err(error) => Err(error),
            }
        }
        .boxed()
    }

    fn build_attempt(
        &self,
        opts: &Arc<QueryOptions>,
        query_fn: crate::options::QueryFn,
        signal: &CancellationToken,
        meta: &Option<Arc<Value>>,
        direction: Option<crate::options::FetchDirection>,
    ) -> crate::retry::AttemptFn {
        let query_key = self.query_key.clone();
        let signal = signal.clone();
        let meta = meta.clone();
        match &opts.behavior {
            Some(behavior) => {
                let behavior = Arc::clone(behavior);
                let weak = self.weak_self.clone();
                Arc::new(move || {
                    let data = weak.upgrade().and_then(|q| q.state.lock().data.clone());
                    behavior.fetch(BehaviorContext {
                        query_fn: QueryFunction::Fetch(Arc::clone(&query_fn)),
                        query_key: query_key.clone(),
                        signal: signal.clone(),
                        meta: meta.clone(),
                        direction,
                        data,
                    })
                })
            }
            None => {
                let persister = opts.persister.clone();
                Arc::new(move || {
                    let ctx = QueryFnContext {
                        query_key: query_key.clone(),
                        signal: signal.clone(),
                        meta: meta.clone(),
                        page_param: None,
                    };
                    match &persister {
                        Some(p) => p(Arc::clone(&query_fn), ctx),
                        None => query_fn(ctx),
                    }
                })
            }
        }
    }

    fn on_fetch_success(&self, data: &Arc<Value>) {
        let prev = self.state.lock().data.clone();
        let opts = self.options();
        let shared = opts
            .structural_sharing()
            .apply(prev.as_ref(), Arc::clone(data));
        self.dispatch(QueryAction::Success {
            data: Arc::clone(&shared),
            data_updated_at: None,
            manual: false,
        });
        if let (Some(cache), Some(query)) = (self.cache.upgrade(), self.weak_self.upgrade()) {
            cache.run_success_hooks(&shared, &query);
        }
        if self.observers.lock().is_empty() {
            self.schedule_gc();
        }
    }

    fn on_fetch_error(&self, error: &Arc<anyhow::Error>) {
        if let Some(c) = cancelled(error) {
            if !c.silent {
                let reverted = if c.revert {
                    self.revert_state.lock().take().map(|mut state| {
                        state.fetch_status = FetchStatus::Idle;
                        state
                    })
                } else {
                    None
                };
                match reverted {
                    Some(state) => self.dispatch(QueryAction::SetState { state }),
                    None => self.dispatch(QueryAction::Error {
                        error: Arc::clone(error),
                    }),
                }
            }
        } else {
            debug!(query = %self.query_hash, %error, "fetch failed");
            self.dispatch(QueryAction::Error {
                error: Arc::clone(error),
            });
            if let (Some(cache), Some(query)) = (self.cache.upgrade(), self.weak_self.upgrade()) {
                cache.run_error_hooks(error, &query);
            }
        }
        if self.observers.lock().is_empty() {
            self.schedule_gc();
        }
    }

    /// Writes data directly (manual write path). Returns the stored payload
    /// after structural sharing.
    pub(crate) fn set_data(&self, data: Value, updated_at: Option<u64>) -> Arc<Value> {
        let prev = self.state.lock().data.clone();
        let shared = self
            .options()
            .structural_sharing()
            .apply(prev.as_ref(), Arc::new(data));
        self.dispatch(QueryAction::Success {
            data: Arc::clone(&shared),
            data_updated_at: updated_at,
            manual: true,
        });
        shared
    }

    /// Replaces the whole state (hydration).
    pub(crate) fn set_state(&self, state: QueryState) {
        self.dispatch(QueryAction::SetState { state });
    }

    /// Cancels the in-flight fetch, if any. Resolves once it settled.
    pub fn cancel(&self, options: CancelOptions) -> BoxFuture<'static, ()> {
        let retryer = self.retryer.lock().clone();
        async move {
            if let Some(retryer) = retryer {
                retryer.cancel(options);
                let _ = retryer.promise().await;
            }
        }
        .boxed()
    }

    /// Cancels any fetch and returns to the freshly-built state.
    pub fn reset(&self) {
        self.destroy();
        self.dispatch(QueryAction::SetState {
            state: self.initial_state.clone(),
        });
    }

    /// Cancels fetches and clears timers; called on cache removal.
    pub(crate) fn destroy(&self) {
        if let Some(task) = self.gc_task.lock().take() {
            task.abort();
        }
        if let Some(retryer) = self.retryer.lock().take() {
            retryer.cancel(CancelOptions::silent());
        }
    }

    pub(crate) fn add_observer(&self, observer: Arc<dyn QueryObserverLink>) {
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
        if let (Some(cache), Some(query)) = (self.cache.upgrade(), self.weak_self.upgrade()) {
            cache.notify(QueryCacheEvent::ObserverAdded { query });
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
            if let Some(retryer) = self.retryer.lock().clone() {
                retryer.cancel_retry();
            }
            self.schedule_gc();
        }
        if let (Some(cache), Some(query)) = (self.cache.upgrade(), self.weak_self.upgrade()) {
            cache.notify(QueryCacheEvent::ObserverRemoved { query });
        }
    }

    /// Focus regained: refetch per observer policy, resume a paused chain.
    pub(crate) fn on_focus(&self) {
        let interested = self
            .observers
            .lock()
            .iter()
            .find(|o| o.should_fetch_on_window_focus())
            .cloned();
        if let Some(observer) = interested {
            observer.trigger_refetch();
        }
        if let Some(retryer) = self.retryer.lock().clone() {
            retryer.resume();
        }
    }

    /// Connectivity regained: refetch per observer policy, resume a paused
    /// chain.
    pub(crate) fn on_online(&self) {
        let interested = self
            .observers
            .lock()
            .iter()
            .find(|o| o.should_fetch_on_reconnect())
            .cloned();
        if let Some(observer) = interested {
            observer.trigger_refetch();
        }
        if let Some(retryer) = self.retryer.lock().clone() {
            retryer.resume();
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
            if let (Some(cache), Some(query)) = (cache.upgrade(), weak.upgrade()) {
                if query.observers_count() == 0 && query.state.lock().fetch_status == FetchStatus::Idle
                {
                    debug!(query = %query.query_hash, "gc expired, removing");
                    cache.remove(&query);
                }
            }
        });
    }

    fn dispatch(&self, action: QueryAction) {
        {
            let mut state = self.state.lock();
            *state = self.reduce(&state, &action);
        }
        let observers = self.observers.lock().clone();
        let query = self.weak_self.upgrade();
        notify_manager().batch(|| {
            for observer in &observers {
                observer.on_query_update(&action);
            }
            if let (Some(cache), Some(query)) = (self.cache.upgrade(), query) {
                cache.notify(QueryCacheEvent::Updated { query, action });
            }
        });
    }

    fn reduce(&self, state: &QueryState, action: &QueryAction) -> QueryState {
        match action {
            QueryAction::Fetch { meta } => {
                let mut next = state.clone();
                next.fetch_failure_count = 0;
                next.fetch_failure_reason = None;
                next.fetch_meta = meta.clone();
                next.fetch_status = if can_fetch(self.options().network_mode()) {
                    FetchStatus::Fetching
                } else {
                    FetchStatus::Paused
                };
                if next.data_updated_at == 0 {
                    next.error = None;
                    next.status = QueryStatus::Pending;
                }
                next
            }
            QueryAction::Failed {
                failure_count,
                error,
            } => {
                let mut next = state.clone();
                next.fetch_failure_count = *failure_count;
                next.fetch_failure_reason = Some(Arc::clone(error));
                next
            }
            QueryAction::Pause => {
                let mut next = state.clone();
                next.fetch_status = FetchStatus::Paused;
                next
            }
            QueryAction::Continue => {
                let mut next = state.clone();
                next.fetch_status = FetchStatus::Fetching;
                next
            }
            QueryAction::Success {
                data,
                data_updated_at,
                manual,
            } => {
                let mut next = state.clone();
                next.data = Some(Arc::clone(data));
                next.data_updated_at = data_updated_at.unwrap_or_else(rt::now_ms);
                next.error = None;
                next.is_invalidated = false;
                next.status = QueryStatus::Success;
                if !manual {
                    next.fetch_status = FetchStatus::Idle;
                    next.fetch_failure_count = 0;
                    next.fetch_failure_reason = None;
                }
                next
            }
            QueryAction::Error { error } => {
                let mut next = state.clone();
                next.error = Some(Arc::clone(error));
                next.error_updated_at = rt::now_ms();
                next.fetch_failure_count = state.fetch_failure_count + 1;
                next.fetch_failure_reason = Some(Arc::clone(error));
                next.fetch_status = FetchStatus::Idle;
                next.status = QueryStatus::Error;
                next
            }
            QueryAction::Invalidate => {
                let mut next = state.clone();
                next.is_invalidated = true;
                next
            }
            QueryAction::SetState { state } => state.clone(),
        }
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Query")
            .field("query_hash", &self.query_hash)
            .field("status", &state.status)
            .field("fetch_status", &state.fetch_status)
            .field("observers", &self.observers.lock().len())
            .finish_non_exhaustive()
    }
}
