//! # Options for queries, observers, and mutations.
//!
//! Options follow the unset-then-default model: every defaultable field is
//! an `Option` filled in three layers — explicit per-call values, client
//! defaults registered for a matching key, then the engine's hard defaults
//! exposed through the effective accessors (`retry()`, `stale_time()`, ...).
//!
//! User-supplied work is handed over as boxed async closures receiving a
//! [`QueryFnContext`] with the query key and a cancellation token, the same
//! shape as tasks receiving their token in a supervised runtime.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::key::{QueryKey, QueryKeyHashFn, hash_query_key};
use crate::retry::{NetworkMode, RetryDelay, RetryPolicy};
use crate::sharing::StructuralSharing;

/// Context handed to every query function invocation.
#[derive(Clone)]
pub struct QueryFnContext {
    /// Key of the query being fetched.
    pub query_key: QueryKey,
    /// Abort signal; cancelled when the fetch is cancelled or replaced.
    pub signal: CancellationToken,
    /// User meta attached to the fetch.
    pub meta: Option<Arc<Value>>,
    /// Page parameter, set for paged (infinite) fetches.
    pub page_param: Option<Value>,
}

/// Async read operation supplied by the caller.
pub type QueryFn =
    Arc<dyn Fn(QueryFnContext) -> BoxFuture<'static, Result<Value, anyhow::Error>> + Send + Sync>;

/// A query function slot: either a fetcher or the skip sentinel.
///
/// [`QueryFunction::Skip`] disables the query entirely; `enabled` is forced
/// off during options resolution and any direct fetch rejects.
#[derive(Clone)]
pub enum QueryFunction {
    /// Run this fetcher.
    Fetch(QueryFn),
    /// Never fetch.
    Skip,
}

impl std::fmt::Debug for QueryFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryFunction::Fetch(_) => f.write_str("QueryFunction::Fetch(..)"),
            QueryFunction::Skip => f.write_str("QueryFunction::Skip"),
        }
    }
}

/// Wraps an async closure into a [`QueryFunction`].
pub fn query_fn<F, Fut>(f: F) -> QueryFunction
where
    F: Fn(QueryFnContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, anyhow::Error>> + Send + 'static,
{
    QueryFunction::Fetch(Arc::new(move |ctx| f(ctx).boxed()))
}

/// Wraps a fetcher so it can consult a persisted layer first
/// (offline-first caches). Receives the inner fetcher and the context.
pub type FetchPersister = Arc<
    dyn Fn(QueryFn, QueryFnContext) -> BoxFuture<'static, Result<Value, anyhow::Error>>
        + Send
        + Sync,
>;

/// Delay before an observer-less entry is removed from its cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcTime {
    /// Remove the entry this long after its last observer detached.
    After(Duration),
    /// Keep the entry forever.
    Never,
}

impl Default for GcTime {
    /// Five minutes.
    fn default() -> Self {
        GcTime::After(Duration::from_secs(300))
    }
}

/// Replaceable fetch pipeline hook (used by paged queries).
pub trait QueryBehavior: Send + Sync {
    /// Produces the fetch future for one attempt.
    fn fetch(&self, ctx: BehaviorContext) -> BoxFuture<'static, Result<Value, anyhow::Error>>;
}

/// Direction of a paged fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchDirection {
    /// Append a page at the end.
    Forward,
    /// Prepend a page at the front.
    Backward,
}

/// Everything a [`QueryBehavior`] needs to assemble one attempt.
#[derive(Clone)]
pub struct BehaviorContext {
    /// The configured fetcher.
    pub query_fn: QueryFunction,
    /// Key of the query being fetched.
    pub query_key: QueryKey,
    /// Abort signal for this attempt chain.
    pub signal: CancellationToken,
    /// User meta attached to the fetch.
    pub meta: Option<Arc<Value>>,
    /// Requested page direction, if any.
    pub direction: Option<FetchDirection>,
    /// Data currently cached for the query.
    pub data: Option<Arc<Value>>,
}

/// Options describing one cached query.
#[derive(Clone, Default)]
pub struct QueryOptions {
    /// Key identifying the entry.
    pub query_key: QueryKey,
    /// Precomputed canonical hash; derived from the key when absent.
    pub query_hash: Option<String>,
    /// Per-query override of the canonical hash.
    pub query_key_hash_fn: Option<QueryKeyHashFn>,
    /// Fetcher or skip sentinel.
    pub query_fn: Option<QueryFunction>,
    /// Retry policy for failed attempts.
    pub retry: Option<RetryPolicy>,
    /// Delay between attempts.
    pub retry_delay: Option<RetryDelay>,
    /// Connectivity gating.
    pub network_mode: Option<NetworkMode>,
    /// Collection delay for observer-less entries.
    pub gc_time: Option<GcTime>,
    /// Age after which data counts as stale.
    pub stale_time: Option<Duration>,
    /// Whether the query may fetch at all.
    pub enabled: Option<bool>,
    /// Merge strategy for successful payloads.
    pub structural_sharing: Option<StructuralSharing>,
    /// Data seeded into a freshly built entry.
    pub initial_data: Option<Value>,
    /// Timestamp for the seeded data (epoch ms); defaults to now.
    pub initial_data_updated_at: Option<u64>,
    /// User meta forwarded to fetch contexts and state.
    pub meta: Option<Arc<Value>>,
    /// Fetch pipeline hook (paged queries install theirs here).
    pub behavior: Option<Arc<dyn QueryBehavior>>,
    /// Persisted-layer wrapper around the fetcher.
    pub persister: Option<FetchPersister>,
}

impl QueryOptions {
    /// Options for `query_key` with everything else unset.
    pub fn new(query_key: QueryKey) -> Self {
        Self {
            query_key,
            ..Self::default()
        }
    }

    /// Sets the fetcher from an async closure.
    pub fn with_query_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(QueryFnContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, anyhow::Error>> + Send + 'static,
    {
        self.query_fn = Some(query_fn(f));
        self
    }

    /// Marks the query function as the skip sentinel.
    pub fn with_skip(mut self) -> Self {
        self.query_fn = Some(QueryFunction::Skip);
        self
    }

    pub fn with_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    pub fn with_retry_delay(mut self, delay: RetryDelay) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_network_mode(mut self, mode: NetworkMode) -> Self {
        self.network_mode = Some(mode);
        self
    }

    pub fn with_gc_time(mut self, gc_time: GcTime) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn with_structural_sharing(mut self, sharing: StructuralSharing) -> Self {
        self.structural_sharing = Some(sharing);
        self
    }

    pub fn with_initial_data(mut self, data: Value) -> Self {
        self.initial_data = Some(data);
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(Arc::new(meta));
        self
    }

    /// Canonical hash of this query, honoring a per-query override.
    pub fn hash(&self) -> String {
        if let Some(hash) = &self.query_hash {
            return hash.clone();
        }
        match &self.query_key_hash_fn {
            Some(f) => f(&self.query_key),
            None => hash_query_key(&self.query_key),
        }
    }

    // Effective values (hard defaults applied).

    pub fn retry(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }

    pub fn retry_delay(&self) -> RetryDelay {
        self.retry_delay.clone().unwrap_or_default()
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.network_mode.unwrap_or_default()
    }

    pub fn gc_time(&self) -> GcTime {
        self.gc_time.unwrap_or_default()
    }

    pub fn stale_time(&self) -> Duration {
        self.stale_time.unwrap_or(Duration::ZERO)
    }

    pub fn enabled(&self) -> bool {
        if matches!(self.query_fn, Some(QueryFunction::Skip)) {
            return false;
        }
        self.enabled.unwrap_or(true)
    }

    pub fn structural_sharing(&self) -> StructuralSharing {
        self.structural_sharing.clone().unwrap_or_default()
    }
}

impl std::fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("query_key", &self.query_key)
            .field("query_hash", &self.hash())
            .field("retry", &self.retry)
            .field("network_mode", &self.network_mode)
            .field("gc_time", &self.gc_time)
            .field("stale_time", &self.stale_time)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Refetch policy for mount, window focus, and reconnect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Refetch {
    /// Never refetch on this trigger.
    Never,
    /// Refetch when the query is stale (default).
    #[default]
    IfStale,
    /// Refetch unconditionally.
    Always,
}

/// Transforms the cached payload into the observer's exposed data.
pub type SelectFn = Arc<dyn Fn(&Value) -> Result<Value, anyhow::Error> + Send + Sync>;

/// Data shown while a query has not produced anything yet.
#[derive(Clone)]
pub enum PlaceholderData {
    /// A fixed value.
    Value(Arc<Value>),
    /// The data of the previously observed query (key transitions).
    KeepPrevious,
}

impl std::fmt::Debug for PlaceholderData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaceholderData::Value(v) => write!(f, "PlaceholderData::Value({v})"),
            PlaceholderData::KeepPrevious => f.write_str("PlaceholderData::KeepPrevious"),
        }
    }
}

/// Result fields an observer may restrict its notifications to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultProp {
    Data,
    Error,
    Status,
    FetchStatus,
    IsStale,
    IsPlaceholderData,
    FailureCount,
    FailureReason,
    DataUpdatedAt,
    ErrorUpdatedAt,
}

/// Options for one query observer (a subscription point over a query).
#[derive(Clone, Default)]
pub struct QueryObserverOptions {
    /// The underlying query options.
    pub query: QueryOptions,
    /// Refetch policy applied when the first listener subscribes.
    pub refetch_on_mount: Option<Refetch>,
    /// Refetch policy applied on window focus.
    pub refetch_on_window_focus: Option<Refetch>,
    /// Refetch policy applied on reconnect.
    pub refetch_on_reconnect: Option<Refetch>,
    /// Polling interval; disabled when unset.
    pub refetch_interval: Option<Duration>,
    /// Keep polling while unfocused.
    pub refetch_interval_in_background: bool,
    /// Derived-data selector applied to the cached payload.
    pub select: Option<SelectFn>,
    /// Data exposed while the query is pending without data.
    pub placeholder_data: Option<PlaceholderData>,
    /// Restrict notifications to these result fields (unset: notify on any
    /// change).
    pub notify_on_change_props: Option<Vec<ResultProp>>,
    /// Surface stored errors through `QueryObserverResult::try_data`.
    pub throw_on_error: Option<bool>,
    /// Suspense-style consumption; defaults `throw_on_error` on.
    pub suspense: Option<bool>,
}

impl QueryObserverOptions {
    pub fn new(query: QueryOptions) -> Self {
        Self {
            query,
            ..Self::default()
        }
    }

    pub fn with_refetch_on_window_focus(mut self, refetch: Refetch) -> Self {
        self.refetch_on_window_focus = Some(refetch);
        self
    }

    pub fn with_refetch_on_reconnect(mut self, refetch: Refetch) -> Self {
        self.refetch_on_reconnect = Some(refetch);
        self
    }

    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn with_select<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, anyhow::Error> + Send + Sync + 'static,
    {
        self.select = Some(Arc::new(f));
        self
    }

    pub fn with_placeholder_data(mut self, placeholder: PlaceholderData) -> Self {
        self.placeholder_data = Some(placeholder);
        self
    }

    pub fn with_notify_on_change_props(mut self, props: Vec<ResultProp>) -> Self {
        self.notify_on_change_props = Some(props);
        self
    }

    pub fn refetch_on_mount(&self) -> Refetch {
        self.refetch_on_mount.unwrap_or_default()
    }

    pub fn refetch_on_window_focus(&self) -> Refetch {
        self.refetch_on_window_focus.unwrap_or_default()
    }

    pub fn refetch_on_reconnect(&self) -> Refetch {
        self.refetch_on_reconnect.unwrap_or_default()
    }

    pub fn throw_on_error(&self) -> bool {
        self.throw_on_error
            .unwrap_or_else(|| self.suspense.unwrap_or(false))
    }
}

/// Async write operation supplied by the caller; receives the variables.
pub type MutationFn =
    Arc<dyn Fn(Arc<Value>) -> BoxFuture<'static, Result<Value, anyhow::Error>> + Send + Sync>;

/// `on_mutate(variables)`; its `Ok` value becomes the mutation context.
pub type OnMutateFn = Arc<
    dyn Fn(Arc<Value>) -> BoxFuture<'static, Result<Option<Value>, anyhow::Error>> + Send + Sync,
>;

/// `on_success(data, variables, context)`.
pub type MutationSuccessFn = Arc<
    dyn Fn(
            Arc<Value>,
            Arc<Value>,
            Option<Arc<Value>>,
        ) -> BoxFuture<'static, Result<(), anyhow::Error>>
        + Send
        + Sync,
>;

/// `on_error(error, variables, context)`.
pub type MutationErrorFn = Arc<
    dyn Fn(
            Arc<anyhow::Error>,
            Arc<Value>,
            Option<Arc<Value>>,
        ) -> BoxFuture<'static, Result<(), anyhow::Error>>
        + Send
        + Sync,
>;

/// `on_settled(data, error, variables, context)`.
pub type MutationSettledFn = Arc<
    dyn Fn(
            Option<Arc<Value>>,
            Option<Arc<anyhow::Error>>,
            Arc<Value>,
            Option<Arc<Value>>,
        ) -> BoxFuture<'static, Result<(), anyhow::Error>>
        + Send
        + Sync,
>;

/// Options describing one mutation.
#[derive(Clone, Default)]
pub struct MutationOptions {
    /// The write operation itself.
    pub mutation_fn: Option<MutationFn>,
    /// Key used for default matching and introspection (not for lookup).
    pub mutation_key: Option<QueryKey>,
    /// Scope identifier; mutations sharing it run strictly serialized.
    pub scope_id: Option<String>,
    /// Retry policy; mutations default to no retries.
    pub retry: Option<RetryPolicy>,
    /// Delay between attempts.
    pub retry_delay: Option<RetryDelay>,
    /// Connectivity gating.
    pub network_mode: Option<NetworkMode>,
    /// Collection delay for observer-less finished mutations.
    pub gc_time: Option<GcTime>,
    /// Runs before the mutation function; result becomes the context.
    pub on_mutate: Option<OnMutateFn>,
    /// Runs after a successful mutation.
    pub on_success: Option<MutationSuccessFn>,
    /// Runs after a failed mutation.
    pub on_error: Option<MutationErrorFn>,
    /// Runs after success or failure.
    pub on_settled: Option<MutationSettledFn>,
    /// User meta recorded on the mutation.
    pub meta: Option<Arc<Value>>,
}

impl MutationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the mutation function from an async closure.
    pub fn with_mutation_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, anyhow::Error>> + Send + 'static,
    {
        self.mutation_fn = Some(Arc::new(move |vars| f(vars).boxed()));
        self
    }

    pub fn with_mutation_key(mut self, key: QueryKey) -> Self {
        self.mutation_key = Some(key);
        self
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn with_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    pub fn with_network_mode(mut self, mode: NetworkMode) -> Self {
        self.network_mode = Some(mode);
        self
    }

    pub fn with_on_mutate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, anyhow::Error>> + Send + 'static,
    {
        self.on_mutate = Some(Arc::new(move |vars| f(vars).boxed()));
        self
    }

    pub fn with_on_success<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Value>, Arc<Value>, Option<Arc<Value>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.on_success = Some(Arc::new(move |data, vars, ctx| f(data, vars, ctx).boxed()));
        self
    }

    pub fn with_on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<anyhow::Error>, Arc<Value>, Option<Arc<Value>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |err, vars, ctx| f(err, vars, ctx).boxed()));
        self
    }

    pub fn with_on_settled<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Option<Arc<Value>>, Option<Arc<anyhow::Error>>, Arc<Value>, Option<Arc<Value>>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.on_settled = Some(Arc::new(move |data, err, vars, ctx| {
            f(data, err, vars, ctx).boxed()
        }));
        self
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or(RetryPolicy::Never)
    }

    pub fn retry_delay(&self) -> RetryDelay {
        self.retry_delay.clone().unwrap_or_default()
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.network_mode.unwrap_or_default()
    }

    pub fn gc_time(&self) -> GcTime {
        self.gc_time.unwrap_or_default()
    }
}

/// Per-fetch options.
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Cancel an in-flight fetch and start a fresh one instead of joining.
    pub cancel_refetch: bool,
    /// Meta recorded on the fetch transition.
    pub meta: Option<Arc<Value>>,
    /// Page direction for paged queries.
    pub direction: Option<FetchDirection>,
}

impl FetchOptions {
    /// Options used by explicit refetches: replace the in-flight fetch.
    pub fn refetch() -> Self {
        Self {
            cancel_refetch: true,
            ..Self::default()
        }
    }
}
