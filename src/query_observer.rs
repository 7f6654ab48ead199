//! # Per-subscription view over one query.
//!
//! A [`QueryObserver`] derives an adapter-facing [`QueryObserverResult`]
//! from its query's state and options (selector, placeholder data,
//! staleness), and notifies its listeners when the derived result changes.
//! Notifications are coalesced: within one flush a listener sees at most one
//! invocation carrying the latest result.
//!
//! Changing options may re-point the observer at a different query (the
//! resolved hash changed); the previous query loses an observer and may
//! enter gc, while the previous result stays available for
//! [`PlaceholderData::KeepPrevious`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::client::QueryClient;
use crate::focus::focus_manager;
use crate::listeners::{Listeners, Subscription};
use crate::notify::notify_manager;
use crate::options::{FetchOptions, PlaceholderData, QueryObserverOptions, Refetch, ResultProp};
use crate::query::{FetchStatus, Query, QueryAction, QueryObserverLink, QueryStatus};
use crate::query_cache::QueryCacheEvent;
use crate::retry::FetchResult;
use crate::rt;

/// Derived result exposed to adapters.
#[derive(Clone, Debug)]
pub struct QueryObserverResult {
    /// Exposed payload (after selector/placeholder resolution).
    pub data: Option<Arc<Value>>,
    /// Last settled error (or selector error).
    pub error: Option<Arc<anyhow::Error>>,
    /// Outcome axis.
    pub status: QueryStatus,
    /// Execution axis.
    pub fetch_status: FetchStatus,
    /// Whether the entry counts as stale for this observer.
    pub is_stale: bool,
    /// Whether `data` is placeholder rather than fetched data.
    pub is_placeholder_data: bool,
    /// Epoch ms of the last data write.
    pub data_updated_at: u64,
    /// Epoch ms of the last error.
    pub error_updated_at: u64,
    /// Failures of the current/last attempt chain.
    pub failure_count: u32,
    /// Error of the most recent failed attempt.
    pub failure_reason: Option<Arc<anyhow::Error>>,
    throws: bool,
}

impl Default for QueryObserverResult {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            is_stale: true,
            is_placeholder_data: false,
            data_updated_at: 0,
            error_updated_at: 0,
            failure_count: 0,
            failure_reason: None,
            throws: false,
        }
    }
}

impl QueryObserverResult {
    /// No data and no error yet.
    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    /// Data is present.
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    /// The last settled outcome was an error.
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// An attempt chain is running.
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// The attempt chain is suspended awaiting focus/connectivity.
    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }

    /// First fetch: pending with an attempt in flight.
    pub fn is_loading(&self) -> bool {
        self.is_pending() && self.is_fetching()
    }

    /// Background fetch: data already present with an attempt in flight.
    pub fn is_refetching(&self) -> bool {
        self.is_fetching() && !self.is_pending()
    }

    /// The exposed payload.
    pub fn data(&self) -> Option<&Arc<Value>> {
        self.data.as_ref()
    }

    /// The payload, surfacing the stored error when the observer's
    /// throw-on-error policy applies.
    pub fn try_data(&self) -> Result<Option<Arc<Value>>, Arc<anyhow::Error>> {
        if self.throws && self.is_error() {
            if let Some(error) = &self.error {
                return Err(Arc::clone(error));
            }
        }
        Ok(self.data.clone())
    }

    /// Decodes the payload into a typed value.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, anyhow::Error> {
        match &self.data {
            Some(data) => Ok(Some(serde_json::from_value(Value::clone(data))?)),
            None => Ok(None),
        }
    }
}

fn opt_arc_eq<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

fn changed_props(prev: &QueryObserverResult, next: &QueryObserverResult) -> Vec<ResultProp> {
    let mut changed = Vec::new();
    if !opt_arc_eq(&prev.data, &next.data) {
        changed.push(ResultProp::Data);
    }
    if !opt_arc_eq(&prev.error, &next.error) {
        changed.push(ResultProp::Error);
    }
    if prev.status != next.status {
        changed.push(ResultProp::Status);
    }
    if prev.fetch_status != next.fetch_status {
        changed.push(ResultProp::FetchStatus);
    }
    if prev.is_stale != next.is_stale {
        changed.push(ResultProp::IsStale);
    }
    if prev.is_placeholder_data != next.is_placeholder_data {
        changed.push(ResultProp::IsPlaceholderData);
    }
    if prev.failure_count != next.failure_count {
        changed.push(ResultProp::FailureCount);
    }
    if !opt_arc_eq(&prev.failure_reason, &next.failure_reason) {
        changed.push(ResultProp::FailureReason);
    }
    if prev.data_updated_at != next.data_updated_at {
        changed.push(ResultProp::DataUpdatedAt);
    }
    if prev.error_updated_at != next.error_updated_at {
        changed.push(ResultProp::ErrorUpdatedAt);
    }
    changed
}

#[derive(Clone)]
struct SelectMemo {
    input: usize,
    output: Arc<Value>,
}

type ObserverListener = dyn Fn(&QueryObserverResult) + Send + Sync;

fn next_observer_id() -> u64 {
    static OBSERVER_SEQ: OnceLock<AtomicU64> = OnceLock::new();
    OBSERVER_SEQ
        .get_or_init(|| AtomicU64::new(1))
        .fetch_add(1, Ordering::Relaxed)
}

/// Subscription point over one query.
pub struct QueryObserver {
    id: u64,
    client: Arc<QueryClient>,
    weak_self: Weak<QueryObserver>,
    options: Mutex<Arc<QueryObserverOptions>>,
    current_query: Mutex<Arc<Query>>,
    current_result: Mutex<QueryObserverResult>,
    previous_result: Mutex<Option<QueryObserverResult>>,
    select_memo: Mutex<Option<SelectMemo>>,
    listeners: Listeners<ObserverListener>,
    interval_task: Mutex<Option<JoinHandle<()>>>,
    notify_pending: AtomicBool,
}

impl QueryObserver {
    /// Creates an observer over the query resolved from `options`.
    pub fn new(client: &Arc<QueryClient>, options: QueryObserverOptions) -> Arc<Self> {
        let options = client.default_query_observer_options(options);
        let query = client
            .query_cache()
            .build(Arc::new(options.query.clone()), None);
        let observer = Arc::new_cyclic(|weak_self| Self {
            id: next_observer_id(),
            client: Arc::clone(client),
            weak_self: weak_self.clone(),
            options: Mutex::new(Arc::clone(&options)),
            current_query: Mutex::new(Arc::clone(&query)),
            current_result: Mutex::new(QueryObserverResult::default()),
            previous_result: Mutex::new(None),
            select_memo: Mutex::new(None),
            listeners: Listeners::new(),
            interval_task: Mutex::new(None),
            notify_pending: AtomicBool::new(false),
        });
        let result = observer.create_result(&query, &options);
        *observer.current_result.lock() = result;
        observer
    }

    /// Current options.
    pub fn options(&self) -> Arc<QueryObserverOptions> {
        Arc::clone(&self.options.lock())
    }

    /// The query currently observed.
    pub fn current_query(&self) -> Arc<Query> {
        Arc::clone(&self.current_query.lock())
    }

    /// Latest derived result.
    pub fn get_current_result(&self) -> QueryObserverResult {
        self.current_result.lock().clone()
    }

    /// Subscribes a listener. The first listener attaches the observer to
    /// its query and may trigger a mount fetch.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryObserverResult) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.listeners.subscribe(Arc::new(listener));
        if self.listeners.len() == 1 {
            let query = self.current_query();
            if let Some(link) = self.weak_self.upgrade() {
                query.add_observer(link as Arc<dyn QueryObserverLink>);
            }
            if self.should_fetch_on_mount(&query) {
                drop(self.execute_fetch(None));
            } else {
                self.update_result();
            }
            self.update_interval();
        }
        let weak = self.weak_self.clone();
        Subscription::new(move || {
            if let Some(observer) = weak.upgrade() {
                observer.on_unsubscribe(id);
            }
        })
    }

    fn on_unsubscribe(&self, listener_id: u64) {
        self.listeners.unsubscribe(listener_id);
        if !self.listeners.has_listeners() {
            if let Some(task) = self.interval_task.lock().take() {
                task.abort();
            }
            self.current_query().remove_observer(self.id);
        }
    }

    /// Re-resolves options; swaps queries when the resolved hash changed.
    pub fn set_options(&self, options: QueryObserverOptions) {
        let options = self.client.default_query_observer_options(options);
        let prev_query = self.current_query();
        *self.options.lock() = Arc::clone(&options);

        let hash = options.query.hash();
        let query_changed = hash != prev_query.query_hash();
        let query = if query_changed {
            let query = self
                .client
                .query_cache()
                .build(Arc::new(options.query.clone()), None);
            *self.previous_result.lock() = Some(self.get_current_result());
            *self.select_memo.lock() = None;
            *self.current_query.lock() = Arc::clone(&query);
            if self.listeners.has_listeners() {
                prev_query.remove_observer(self.id);
                if let Some(link) = self.weak_self.upgrade() {
                    query.add_observer(link as Arc<dyn QueryObserverLink>);
                }
            }
            query
        } else {
            prev_query.set_options(Arc::new(options.query.clone()));
            prev_query
        };

        self.client.query_cache().notify(QueryCacheEvent::ObserverOptionsUpdated {
            query: Arc::clone(&query),
        });

        if self.listeners.has_listeners()
            && query_changed
            && self.should_fetch_on_mount(&query)
        {
            drop(self.execute_fetch(None));
        }
        self.update_interval();
        self.update_result();
    }

    /// Forces a refetch, replacing any in-flight fetch.
    pub fn refetch(&self) -> BoxFuture<'static, FetchResult> {
        self.execute_fetch(Some(FetchOptions::refetch()))
    }

    fn execute_fetch(&self, fetch_options: Option<FetchOptions>) -> BoxFuture<'static, FetchResult> {
        let query = self.current_query();
        let options = self.options();
        query.fetch(Some(Arc::new(options.query.clone())), fetch_options)
    }

    fn should_fetch_on_mount(&self, query: &Arc<Query>) -> bool {
        let options = self.options();
        if !options.query.enabled() {
            return false;
        }
        let state = query.state();
        if state.data_updated_at == 0 {
            // Nothing loaded yet; error states still retry on mount.
            return true;
        }
        match options.refetch_on_mount() {
            Refetch::Always => true,
            Refetch::IfStale => query.is_stale_by_time(options.query.stale_time()),
            Refetch::Never => false,
        }
    }

    fn update_result(&self) {
        let query = self.current_query();
        let options = self.options();
        let next = self.create_result(&query, &options);
        let changed = {
            let mut current = self.current_result.lock();
            let changed = changed_props(&current, &next);
            *current = next;
            changed
        };
        if changed.is_empty() {
            return;
        }
        let should_notify = match &options.notify_on_change_props {
            None => true,
            Some(tracked) => changed.iter().any(|p| tracked.contains(p)),
        };
        if should_notify {
            self.notify_listeners();
        }
        self.client
            .query_cache()
            .notify(QueryCacheEvent::ObserverResultsUpdated { query });
    }

    /// Coalesced listener delivery: one invocation per flush carrying the
    /// result current at flush time.
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

    fn create_result(
        &self,
        query: &Arc<Query>,
        options: &QueryObserverOptions,
    ) -> QueryObserverResult {
        let state = query.state();
        let mut data = state.data.clone();
        let mut status = state.status;
        let mut error = state.error.clone();
        let mut is_placeholder = false;

        if data.is_none() && status == QueryStatus::Pending {
            match &options.placeholder_data {
                Some(PlaceholderData::Value(placeholder)) => {
                    data = Some(Arc::clone(placeholder));
                    status = QueryStatus::Success;
                    is_placeholder = true;
                }
                Some(PlaceholderData::KeepPrevious) => {
                    let previous = self.previous_result.lock().clone();
                    if let Some(previous_data) = previous.and_then(|r| r.data) {
                        data = Some(previous_data);
                        status = QueryStatus::Success;
                        is_placeholder = true;
                    }
                }
                None => {}
            }
        }

        if let (Some(select), Some(input)) = (&options.select, data.clone()) {
            let input_ptr = Arc::as_ptr(&input) as usize;
            let memoized = self
                .select_memo
                .lock()
                .clone()
                .filter(|m| m.input == input_ptr);
            match memoized {
                Some(memo) => data = Some(memo.output),
                None => match select(&input) {
                    Ok(selected) => {
                        let output = Arc::new(selected);
                        *self.select_memo.lock() = Some(SelectMemo {
                            input: input_ptr,
                            output: Arc::clone(&output),
                        });
                        data = Some(output);
                    }
                    Err(select_error) => {
                        let select_error = Arc::new(select_error);
                        error = Some(select_error);
                        status = QueryStatus::Error;
                    }
                },
            }
        }

        QueryObserverResult {
            data,
            error,
            status,
            fetch_status: state.fetch_status,
            is_stale: query.is_stale_by_time(options.query.stale_time()),
            is_placeholder_data: is_placeholder,
            data_updated_at: state.data_updated_at,
            error_updated_at: state.error_updated_at,
            failure_count: state.fetch_failure_count,
            failure_reason: state.fetch_failure_reason.clone(),
            throws: options.throw_on_error(),
        }
    }

    fn update_interval(&self) {
        let mut task = self.interval_task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }
        let options = self.options();
        let Some(interval) = options.refetch_interval else {
            return;
        };
        if !options.query.enabled() || !self.listeners.has_listeners() {
            return;
        }
        let in_background = options.refetch_interval_in_background;
        let weak = self.weak_self.clone();
        *task = rt::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(observer) = weak.upgrade() else {
                    break;
                };
                if in_background || focus_manager().is_focused() {
                    drop(observer.execute_fetch(None));
                }
            }
        });
    }
}

impl QueryObserverLink for QueryObserver {
    fn id(&self) -> u64 {
        self.id
    }

    fn on_query_update(&self, _action: &QueryAction) {
        self.update_result();
    }

    fn should_fetch_on_window_focus(&self) -> bool {
        let options = self.options();
        if !options.query.enabled() {
            return false;
        }
        match options.refetch_on_window_focus() {
            Refetch::Always => true,
            Refetch::IfStale => self
                .current_query()
                .is_stale_by_time(options.query.stale_time()),
            Refetch::Never => false,
        }
    }

    fn should_fetch_on_reconnect(&self) -> bool {
        let options = self.options();
        if !options.query.enabled() {
            return false;
        }
        match options.refetch_on_reconnect() {
            Refetch::Always => true,
            Refetch::IfStale => self
                .current_query()
                .is_stale_by_time(options.query.stale_time()),
            Refetch::Never => false,
        }
    }

    fn trigger_refetch(&self) {
        drop(self.execute_fetch(None));
    }

    fn is_enabled(&self) -> bool {
        self.options.lock().query.enabled()
    }

    fn is_stale(&self) -> bool {
        let options = self.options();
        self.current_query()
            .is_stale_by_time(options.query.stale_time())
    }
}

impl std::fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserver")
            .field("id", &self.id)
            .field("query", &self.current_query().query_hash().to_string())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}
