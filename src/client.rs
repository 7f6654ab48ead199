//! # The engine façade.
//!
//! [`QueryClient`] owns the two caches, resolves layered defaults
//! (global → per-key → per-call), and exposes the public bulk operations.
//! `mount`/`unmount` reference-count the process-wide focus/online
//! subscriptions; on focus or reconnect the client resumes paused mutations
//! first and then broadcasts to the query cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::error::CancelOptions;
use crate::filters::{MutationFilters, QueryFilters, QueryTypeFilter};
use crate::focus::focus_manager;
use crate::infinite::{InfiniteOptions, InfiniteQueryBehavior};
use crate::key::QueryKey;
use crate::listeners::Subscription;
use crate::mutation::MutationStatus;
use crate::mutation_cache::MutationCache;
use crate::notify::notify_manager;
use crate::online::online_manager;
use crate::options::{
    FetchOptions, GcTime, MutationErrorFn, MutationFn, MutationOptions, MutationSettledFn,
    MutationSuccessFn, OnMutateFn, QueryFunction, QueryObserverOptions, QueryOptions, Refetch,
};
use crate::query::{FetchStatus, QueryState};
use crate::query_cache::QueryCache;
use crate::retry::{NetworkMode, RetryDelay, RetryPolicy};
use crate::rt;
use crate::sharing::StructuralSharing;

/// Partial query defaults registered globally or per key prefix.
#[derive(Clone, Default)]
pub struct QueryDefaults {
    pub query_fn: Option<QueryFunction>,
    pub retry: Option<RetryPolicy>,
    pub retry_delay: Option<RetryDelay>,
    pub network_mode: Option<NetworkMode>,
    pub gc_time: Option<GcTime>,
    pub stale_time: Option<Duration>,
    pub structural_sharing: Option<StructuralSharing>,
    pub meta: Option<Arc<Value>>,
    pub refetch_on_mount: Option<Refetch>,
    pub refetch_on_window_focus: Option<Refetch>,
    pub refetch_on_reconnect: Option<Refetch>,
    pub throw_on_error: Option<bool>,
}

/// Partial mutation defaults registered globally or per key prefix.
#[derive(Clone, Default)]
pub struct MutationDefaults {
    pub mutation_fn: Option<MutationFn>,
    pub retry: Option<RetryPolicy>,
    pub retry_delay: Option<RetryDelay>,
    pub network_mode: Option<NetworkMode>,
    pub gc_time: Option<GcTime>,
    pub scope_id: Option<String>,
    pub on_mutate: Option<OnMutateFn>,
    pub on_success: Option<MutationSuccessFn>,
    pub on_error: Option<MutationErrorFn>,
    pub on_settled: Option<MutationSettledFn>,
    pub meta: Option<Arc<Value>>,
}

/// Global defaults applied to every query and mutation.
#[derive(Clone, Default)]
pub struct DefaultOptions {
    pub queries: QueryDefaults,
    pub mutations: MutationDefaults,
}

/// Which queries an invalidation refetches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefetchType {
    /// Refetch matches with enabled observers (default).
    #[default]
    Active,
    /// Refetch matches without enabled observers.
    Inactive,
    /// Refetch every match.
    All,
    /// Mark stale only; never refetch.
    None,
}

/// Options for a paged (infinite) query operation.
#[derive(Clone)]
pub struct InfiniteQueryOptions {
    /// The underlying query options.
    pub query: QueryOptions,
    /// Paging configuration.
    pub infinite: InfiniteOptions,
    /// Number of pages to load on the initial fetch.
    pub pages: Option<usize>,
}

impl InfiniteQueryOptions {
    pub fn new(query: QueryOptions, infinite: InfiniteOptions) -> Self {
        Self {
            query,
            infinite,
            pages: None,
        }
    }

    pub fn with_pages(mut self, pages: usize) -> Self {
        self.pages = Some(pages);
        self
    }

    fn into_query_options(self) -> QueryOptions {
        let mut query = self.query;
        query.behavior = Some(InfiniteQueryBehavior::new(self.infinite, self.pages));
        query
    }
}

/// Builder for a [`QueryClient`].
#[derive(Default)]
pub struct QueryClientBuilder {
    query_cache: Option<Arc<QueryCache>>,
    mutation_cache: Option<Arc<MutationCache>>,
    defaults: DefaultOptions,
}

impl QueryClientBuilder {
    pub fn query_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.query_cache = Some(cache);
        self
    }

    pub fn mutation_cache(mut self, cache: Arc<MutationCache>) -> Self {
        self.mutation_cache = Some(cache);
        self
    }

    pub fn default_options(mut self, defaults: DefaultOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn build(self) -> Arc<QueryClient> {
        Arc::new_cyclic(|weak_self| QueryClient {
            weak_self: weak_self.clone(),
            query_cache: self.query_cache.unwrap_or_else(QueryCache::new),
            mutation_cache: self.mutation_cache.unwrap_or_else(MutationCache::new),
            defaults: Mutex::new(self.defaults),
            query_defaults: Mutex::new(Vec::new()),
            mutation_defaults: Mutex::new(Vec::new()),
            mount_count: AtomicUsize::new(0),
            focus_sub: Mutex::new(None),
            online_sub: Mutex::new(None),
        })
    }
}

/// Façade binding caches, defaults, and public operations.
pub struct QueryClient {
    weak_self: std::sync::Weak<QueryClient>,
    query_cache: Arc<QueryCache>,
    mutation_cache: Arc<MutationCache>,
    defaults: Mutex<DefaultOptions>,
    query_defaults: Mutex<Vec<(QueryKey, QueryDefaults)>>,
    mutation_defaults: Mutex<Vec<(QueryKey, MutationDefaults)>>,
    mount_count: AtomicUsize,
    focus_sub: Mutex<Option<Subscription>>,
    online_sub: Mutex<Option<Subscription>>,
}

impl QueryClient {
    /// A client with fresh caches and default options.
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::default()
    }

    /// The query cache this client owns.
    pub fn query_cache(&self) -> &Arc<QueryCache> {
        &self.query_cache
    }

    /// The mutation cache this client owns.
    pub fn mutation_cache(&self) -> &Arc<MutationCache> {
        &self.mutation_cache
    }

    /// Replaces the global default options.
    pub fn set_default_options(&self, defaults: DefaultOptions) {
        *self.defaults.lock() = defaults;
    }

    /// Registers query defaults for keys matching `key` partially.
    pub fn set_query_defaults(&self, key: QueryKey, defaults: QueryDefaults) {
        let mut registered = self.query_defaults.lock();
        registered.retain(|(k, _)| k != &key);
        registered.push((key, defaults));
    }

    /// Registers mutation defaults for mutation keys matching `key`
    /// partially.
    pub fn set_mutation_defaults(&self, key: QueryKey, defaults: MutationDefaults) {
        let mut registered = self.mutation_defaults.lock();
        registered.retain(|(k, _)| k != &key);
        registered.push((key, defaults));
    }

    // ---- options resolution ----

    /// Resolves query options against per-key and global defaults.
    pub fn default_query_options(&self, mut options: QueryOptions) -> Arc<QueryOptions> {
        for (key, defaults) in self.query_defaults.lock().iter() {
            if crate::key::partial_match_key(&options.query_key, key) {
                apply_query_defaults(&mut options, defaults);
            }
        }
        let global = self.defaults.lock().queries.clone();
        apply_query_defaults(&mut options, &global);

        if matches!(options.query_fn, Some(QueryFunction::Skip)) {
            options.enabled = Some(false);
        }
        if options.network_mode.is_none() && options.persister.is_some() {
            options.network_mode = Some(NetworkMode::OfflineFirst);
        }
        options.query_hash = Some(options.hash());
        Arc::new(options)
    }

    /// Resolves observer options (query part plus observer-level defaults).
    pub fn default_query_observer_options(
        &self,
        mut options: QueryObserverOptions,
    ) -> Arc<QueryObserverOptions> {
        let query = std::mem::take(&mut options.query);
        options.query = (*self.default_query_options(query)).clone();

        let apply_observer = |options: &mut QueryObserverOptions, defaults: &QueryDefaults| {
            if options.refetch_on_mount.is_none() {
                options.refetch_on_mount = defaults.refetch_on_mount;
            }
            if options.refetch_on_window_focus.is_none() {
                options.refetch_on_window_focus = defaults.refetch_on_window_focus;
            }
            if options.refetch_on_reconnect.is_none() {
                options.refetch_on_reconnect = defaults.refetch_on_reconnect;
            }
            if options.throw_on_error.is_none() {
                options.throw_on_error = defaults.throw_on_error;
            }
        };
        for (key, defaults) in self.query_defaults.lock().iter() {
            if crate::key::partial_match_key(&options.query.query_key, key) {
                apply_observer(&mut options, defaults);
            }
        }
        let global = self.defaults.lock().queries.clone();
        apply_observer(&mut options, &global);

        // With connectivity ignored there is nothing to react to.
        if options.refetch_on_reconnect.is_none()
            && options.query.network_mode() == NetworkMode::Always
        {
            options.refetch_on_reconnect = Some(Refetch::Never);
        }
        Arc::new(options)
    }

    /// Resolves mutation options against per-key and global defaults.
    pub fn default_mutation_options(&self, mut options: MutationOptions) -> Arc<MutationOptions> {
        if let Some(mutation_key) = options.mutation_key.clone() {
            for (key, defaults) in self.mutation_defaults.lock().iter() {
                if crate::key::partial_match_key(&mutation_key, key) {
                    apply_mutation_defaults(&mut options, defaults);
                }
            }
        }
        let global = self.defaults.lock().mutations.clone();
        apply_mutation_defaults(&mut options, &global);
        Arc::new(options)
    }

    // ---- query operations ----

    /// Fetches a query, serving fresh cached data without a fetch.
    /// Unlike observer-driven fetches, retries default off.
    pub async fn fetch_query(
        &self,
        mut options: QueryOptions,
    ) -> Result<Arc<Value>, Arc<anyhow::Error>> {
        if options.retry.is_none() {
            options.retry = Some(RetryPolicy::Never);
        }
        let defaulted = self.default_query_options(options);
        let query = self.query_cache.build(Arc::clone(&defaulted), None);
        if query.is_stale_by_time(defaulted.stale_time()) {
            query.fetch(Some(defaulted), None).await
        } else {
            match query.state().data {
                Some(data) => Ok(data),
                None => query.fetch(Some(defaulted), None).await,
            }
        }
    }

    /// Speculative fetch; errors are swallowed.
    pub async fn prefetch_query(&self, options: QueryOptions) {
        let _ = self.fetch_query(options).await;
    }

    /// Returns cached data, fetching only when absent. With
    /// `revalidate_if_stale`, stale cached data triggers a background
    /// refetch.
    pub async fn ensure_query_data(
        &self,
        options: QueryOptions,
        revalidate_if_stale: bool,
    ) -> Result<Arc<Value>, Arc<anyhow::Error>> {
        let defaulted = self.default_query_options(options.clone());
        let cached = self
            .query_cache
            .get(&defaulted.hash())
            .and_then(|query| query.state().data.map(|data| (query, data)));
        match cached {
            Some((query, data)) => {
                if revalidate_if_stale && query.is_stale_by_time(defaulted.stale_time()) {
                    drop(query.fetch(Some(defaulted), None));
                }
                Ok(data)
            }
            None => self.fetch_query(options).await,
        }
    }

    /// Fetches a paged query (first page, or `pages` pages).
    pub async fn fetch_infinite_query(
        &self,
        options: InfiniteQueryOptions,
    ) -> Result<Arc<Value>, Arc<anyhow::Error>> {
        self.fetch_query(options.into_query_options()).await
    }

    /// Speculative paged fetch; errors are swallowed.
    pub async fn prefetch_infinite_query(&self, options: InfiniteQueryOptions) {
        let _ = self.fetch_infinite_query(options).await;
    }

    /// Returns cached paged data, fetching only when absent.
    pub async fn ensure_infinite_query_data(
        &self,
        options: InfiniteQueryOptions,
        revalidate_if_stale: bool,
    ) -> Result<Arc<Value>, Arc<anyhow::Error>> {
        self.ensure_query_data(options.into_query_options(), revalidate_if_stale)
            .await
    }

    /// Cached payload for `key`, if any.
    pub fn get_query_data(&self, key: &QueryKey) -> Option<Arc<Value>> {
        let defaulted = self.default_query_options(QueryOptions::new(key.clone()));
        self.query_cache
            .get(&defaulted.hash())
            .and_then(|query| query.state().data)
    }

    /// Full state snapshot for `key`, if cached.
    pub fn get_query_state(&self, key: &QueryKey) -> Option<QueryState> {
        let defaulted = self.default_query_options(QueryOptions::new(key.clone()));
        self.query_cache
            .get(&defaulted.hash())
            .map(|query| query.state())
    }

    /// Writes `data` for `key`, building the entry when absent. Returns the
    /// stored payload after structural sharing.
    pub fn set_query_data(&self, key: QueryKey, data: Value) -> Arc<Value> {
        self.set_query_data_with(key, |_| Some(data))
            .unwrap_or_else(|| Arc::new(Value::Null))
    }

    /// Updater-style write; returning `None` bails without touching state.
    pub fn set_query_data_with(
        &self,
        key: QueryKey,
        updater: impl FnOnce(Option<&Arc<Value>>) -> Option<Value>,
    ) -> Option<Arc<Value>> {
        let defaulted = self.default_query_options(QueryOptions::new(key));
        let previous = self
            .query_cache
            .get(&defaulted.hash())
            .and_then(|query| query.state().data);
        let next = updater(previous.as_ref())?;
        let query = self.query_cache.build(defaulted, None);
        Some(query.set_data(next, None))
    }

    /// Key/data pairs of every query matching `filters`.
    pub fn get_queries_data(&self, filters: &QueryFilters) -> Vec<(QueryKey, Option<Arc<Value>>)> {
        self.query_cache
            .find_all(filters)
            .into_iter()
            .map(|query| (query.query_key().clone(), query.state().data))
            .collect()
    }

    /// Writes `data` into every query matching `filters`, batched.
    pub fn set_queries_data(
        &self,
        filters: &QueryFilters,
        data: Value,
    ) -> Vec<(QueryKey, Option<Arc<Value>>)> {
        self.set_queries_data_with(filters, |_| Some(data.clone()))
    }

    /// Applies `updater` to every query matching `filters`, batched.
    pub fn set_queries_data_with(
        &self,
        filters: &QueryFilters,
        updater: impl Fn(Option<&Arc<Value>>) -> Option<Value>,
    ) -> Vec<(QueryKey, Option<Arc<Value>>)> {
        notify_manager().batch(|| {
            self.query_cache
                .find_all(filters)
                .into_iter()
                .map(|query| {
                    let written = self
                        .set_query_data_with(query.query_key().clone(), &updater);
                    (query.query_key().clone(), written)
                })
                .collect()
        })
    }

    /// Marks matches stale and refetches them per `refetch_type`.
    pub async fn invalidate_queries(&self, filters: QueryFilters, refetch_type: RefetchType) {
        notify_manager().batch(|| {
            for query in self.query_cache.find_all(&filters) {
                query.invalidate();
            }
        });
        let query_type = match refetch_type {
            RefetchType::Active => QueryTypeFilter::Active,
            RefetchType::Inactive => QueryTypeFilter::Inactive,
            RefetchType::All => QueryTypeFilter::All,
            RefetchType::None => return,
        };
        let mut refetch_filters = filters;
        refetch_filters.query_type = query_type;
        self.refetch_queries(refetch_filters).await;
    }

    /// Refetches every non-disabled match, replacing in-flight fetches.
    /// Individual failures are swallowed.
    pub async fn refetch_queries(&self, filters: QueryFilters) {
        let fetches: Vec<_> = notify_manager().batch(|| {
            self.query_cache
                .find_all(&filters)
                .into_iter()
                .filter(|query| !query.is_disabled())
                .map(|query| {
                    query.fetch(
                        None,
                        Some(FetchOptions {
                            cancel_refetch: true,
                            ..FetchOptions::default()
                        }),
                    )
                })
                .collect()
        });
        join_all(fetches).await;
    }

    /// Resets matches to their initial state, then refetches active ones.
    pub async fn reset_queries(&self, filters: QueryFilters) {
        notify_manager().batch(|| {
            for query in self.query_cache.find_all(&filters) {
                query.reset();
            }
        });
        let mut refetch_filters = filters;
        refetch_filters.query_type = QueryTypeFilter::Active;
        self.refetch_queries(refetch_filters).await;
    }

    /// Removes matches from the cache, batched.
    pub fn remove_queries(&self, filters: &QueryFilters) {
        notify_manager().batch(|| {
            for query in self.query_cache.find_all(filters) {
                self.query_cache.remove(&query);
            }
        });
    }

    /// Cancels in-flight fetches of every match; resolves once settled.
    pub async fn cancel_queries(&self, filters: &QueryFilters, options: CancelOptions) {
        let cancels: Vec<_> = self
            .query_cache
            .find_all(filters)
            .into_iter()
            .map(|query| query.cancel(options))
            .collect();
        join_all(cancels).await;
    }

    /// Number of matches currently fetching.
    pub fn is_fetching(&self, filters: QueryFilters) -> usize {
        let mut filters = filters;
        filters.fetch_status = Some(FetchStatus::Fetching);
        self.query_cache.find_all(&filters).len()
    }

    /// Number of pending mutations.
    pub fn is_mutating(&self) -> usize {
        self.mutation_cache
            .find_all(&MutationFilters::default().with_status(MutationStatus::Pending))
            .len()
    }

    /// Resumes every paused mutation.
    pub async fn resume_paused_mutations(&self) {
        self.mutation_cache.resume_paused_mutations().await;
    }

    // ---- lifecycle ----

    /// Reference-counted wiring to the focus/online singletons. On focus or
    /// reconnect, paused mutations resume first, then the query cache
    /// broadcast runs.
    pub fn mount(&self) {
        if self.mount_count.fetch_add(1, Ordering::SeqCst) > 0 {
            return;
        }
        debug!("client mounted");
        let weak = self.weak_self.clone();
        *self.focus_sub.lock() = Some(focus_manager().subscribe(move |focused| {
            if focused {
                if let Some(client) = weak.upgrade() {
                    client.resume_then(|client| client.query_cache.on_focus());
                }
            }
        }));
        let weak = self.weak_self.clone();
        *self.online_sub.lock() = Some(online_manager().subscribe(move |online| {
            if online {
                if let Some(client) = weak.upgrade() {
                    client.resume_then(|client| client.query_cache.on_online());
                }
            }
        }));
    }

    /// Drops the focus/online wiring once the last mount is gone.
    pub fn unmount(&self) {
        if self.mount_count.load(Ordering::SeqCst) == 0 {
            return;
        }
        if self.mount_count.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        debug!("client unmounted");
        if let Some(sub) = self.focus_sub.lock().take() {
            sub.unsubscribe();
        }
        if let Some(sub) = self.online_sub.lock().take() {
            sub.unsubscribe();
        }
    }

    fn resume_then(self: Arc<Self>, broadcast: impl FnOnce(&QueryClient) + Send + 'static) {
        rt::spawn(async move {
            self.mutation_cache.resume_paused_mutations().await;
            broadcast(&self);
        });
    }

    /// Empties both caches, batched.
    pub fn clear(&self) {
        notify_manager().batch(|| {
            self.query_cache.clear();
            self.mutation_cache.clear();
        });
    }
}

fn apply_query_defaults(options: &mut QueryOptions, defaults: &QueryDefaults) {
    if options.query_fn.is_none() {
        options.query_fn = defaults.query_fn.clone();
    }
    if options.retry.is_none() {
        options.retry = defaults.retry.clone();
    }
    if options.retry_delay.is_none() {
        options.retry_delay = defaults.retry_delay.clone();
    }
    if options.network_mode.is_none() {
        options.network_mode = defaults.network_mode;
    }
    if options.gc_time.is_none() {
        options.gc_time = defaults.gc_time;
    }
    if options.stale_time.is_none() {
        options.stale_time = defaults.stale_time;
    }
    if options.structural_sharing.is_none() {
        options.structural_sharing = defaults.structural_sharing.clone();
    }
    if options.meta.is_none() {
        options.meta = defaults.meta.clone();
    }
}

fn apply_mutation_defaults(options: &mut MutationOptions, defaults: &MutationDefaults) {
    if options.mutation_fn.is_none() {
        options.mutation_fn = defaults.mutation_fn.clone();
    }
    if options.retry.is_none() {
        options.retry = defaults.retry.clone();
    }
    if options.retry_delay.is_none() {
        options.retry_delay = defaults.retry_delay.clone();
    }
    if options.network_mode.is_none() {
        options.network_mode = defaults.network_mode;
    }
    if options.gc_time.is_none() {
        options.gc_time = defaults.gc_time;
    }
    if options.scope_id.is_none() {
        options.scope_id = defaults.scope_id.clone();
    }
    if options.on_mutate.is_none() {
        options.on_mutate = defaults.on_mutate.clone();
    }
    if options.on_success.is_none() {
        options.on_success = defaults.on_success.clone();
    }
    if options.on_error.is_none() {
        options.on_error = defaults.on_error.clone();
    }
    if options.on_settled.is_none() {
        options.on_settled = defaults.on_settled.clone();
    }
    if options.meta.is_none() {
        options.meta = defaults.meta.clone();
    }
}
