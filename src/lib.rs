//! # queryvisor
//!
//! **Queryvisor** is an asynchronous query/mutation caching engine.
//!
//! It maintains an in-memory store of *queries* (read-only fetches
//! identified by a key) and *mutations* (write operations), deduplicates
//! in-flight work, serves cached data while revalidating, retries with
//! backoff under transient failures, pauses and resumes work with network
//! and window-focus state, and notifies subscribers of state changes in
//! batches. The crate is designed as the core under UI adapters: bindings
//! consume it through the observer types and stay out of the engine.
//!
//! ## Features
//!
//! | Area              | Description                                                      | Key types                                        |
//! |-------------------|------------------------------------------------------------------|--------------------------------------------------|
//! | **Queries**       | Keyed cached fetches with staleness and gc.                      | [`Query`], [`QueryCache`], [`QueryObserver`]     |
//! | **Mutations**     | Write operations with lifecycle callbacks and scopes.            | [`Mutation`], [`MutationCache`], [`MutationObserver`] |
//! | **Retries**       | Single-flight execution, backoff, offline/focus pausing.         | [`RetryPolicy`], [`RetryDelay`], [`NetworkMode`] |
//! | **Reactivity**    | Focus/online singletons with pluggable platform sources.         | [`focus_manager`], [`online_manager`]            |
//! | **Notifications** | Batched listener delivery across nested transactions.            | [`notify_manager`], [`NotifyManager`]            |
//! | **Persistence**   | Serializable snapshots and a storage collaborator.               | [`dehydrate`], [`hydrate`], [`Persister`]        |
//! | **Client**        | Façade binding caches, defaults, and bulk operations.            | [`QueryClient`]                                  |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`EventLogger`] _(demo/reference only)_.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use queryvisor::{QueryClient, QueryObserver, QueryObserverOptions, QueryOptions};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let client = QueryClient::new();
//!     client.mount();
//!
//!     let options = QueryOptions::new(vec![json!("user"), json!(1)])
//!         .with_query_fn(|_ctx| async move { Ok(json!({"id": 1, "name": "ada"})) });
//!
//!     let observer = QueryObserver::new(&client, QueryObserverOptions::new(options));
//!     let _sub = observer.subscribe(|result| {
//!         if let Some(user) = result.data() {
//!             println!("user: {user}");
//!         }
//!     });
//! }
//! ```
//!
//! ---

mod client;
mod error;
mod filters;
mod focus;
mod hydration;
mod infinite;
pub mod key;
mod listeners;
#[cfg(feature = "logging")]
mod logging;
mod mutation;
mod mutation_cache;
mod mutation_observer;
mod notify;
mod online;
mod options;
mod query;
mod query_cache;
mod query_observer;
mod retry;
mod rt;
mod sharing;

// ---- Public re-exports ----

pub use client::{
    DefaultOptions, InfiniteQueryOptions, MutationDefaults, QueryClient, QueryClientBuilder,
    QueryDefaults, RefetchType,
};
pub use error::{CancelOptions, CancelledError, EngineError, cancelled};
pub use filters::{MutationFilters, QueryFilters, QueryTypeFilter};
pub use focus::{FocusManager, FocusSetupFn, focus_manager};
pub use hydration::{
    DehydrateOptions, DehydratedMutation, DehydratedQuery, DehydratedState, Persister, dehydrate,
    hydrate, persist_client_state, restore_client_state,
};
pub use infinite::{InfiniteData, InfiniteOptions, InfiniteQueryBehavior, PageParamFn};
pub use key::{QueryKey, QueryKeyHashFn, hash_query_key, partial_match_key};
pub use listeners::Subscription;
pub use mutation::{Mutation, MutationAction, MutationState, MutationStatus};
pub use mutation_cache::{MutationCache, MutationCacheConfig, MutationCacheEvent};
pub use mutation_observer::{MutateCallbacks, MutationObserver, MutationObserverResult};
pub use notify::{NotifyCallback, NotifyHook, NotifyManager, notify_manager};
pub use online::{OnlineManager, OnlineSetupFn, online_manager};
pub use options::{
    BehaviorContext, FetchDirection, FetchOptions, GcTime, MutationOptions, PlaceholderData,
    QueryBehavior, QueryFn, QueryFnContext, QueryFunction, QueryObserverOptions, QueryOptions,
    Refetch, ResultProp, SelectFn, query_fn,
};
pub use query::{FetchStatus, Query, QueryAction, QueryState, QueryStatus};
pub use query_cache::{QueryCache, QueryCacheConfig, QueryCacheEvent};
pub use query_observer::{QueryObserver, QueryObserverResult};
pub use retry::{FetchResult, NetworkMode, RetryDelay, RetryPolicy};
pub use sharing::{StructuralSharing, replace_data};

// Optional: expose the built-in cache event logger.
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use logging::EventLogger;
