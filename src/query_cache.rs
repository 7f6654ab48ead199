//! # Keyed store of queries with a typed event stream.
//!
//! [`QueryCache`] maps canonical hashes to [`Query`] entries and re-emits
//! every lifecycle change on its event stream. Event emission is always
//! wrapped in a notification batch: subscribers must not assume synchronous
//! delivery.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::filters::QueryFilters;
use crate::listeners::{Listeners, Subscription};
use crate::notify::notify_manager;
use crate::options::QueryOptions;
use crate::query::{Query, QueryAction, QueryState};

/// Events emitted on the cache stream.
#[derive(Clone, Debug)]
pub enum QueryCacheEvent {
    /// A query entered the cache.
    Added(Arc<Query>),
    /// A query left the cache.
    Removed(Arc<Query>),
    /// A query state transition.
    Updated {
        /// The affected query.
        query: Arc<Query>,
        /// The reducer action that caused the transition.
        action: QueryAction,
    },
    /// An observer attached.
    ObserverAdded {
        /// The affected query.
        query: Arc<Query>,
    },
    /// An observer detached.
    ObserverRemoved {
        /// The affected query.
        query: Arc<Query>,
    },
    /// An observer recomputed its derived result.
    ObserverResultsUpdated {
        /// The affected query.
        query: Arc<Query>,
    },
    /// An observer changed its options.
    ObserverOptionsUpdated {
        /// The affected query.
        query: Arc<Query>,
    },
}

type CacheListener = dyn Fn(&QueryCacheEvent) + Send + Sync;

/// Cache-level lifecycle hooks, layered before per-observer callbacks.
#[derive(Clone, Default)]
pub struct QueryCacheConfig {
    /// Runs after any query fetch fails terminally.
    pub on_error: Option<Arc<dyn Fn(&Arc<anyhow::Error>, &Arc<Query>) + Send + Sync>>,
    /// Runs after any query fetch succeeds.
    pub on_success: Option<Arc<dyn Fn(&Arc<Value>, &Arc<Query>) + Send + Sync>>,
    /// Runs after any query fetch settles.
    pub on_settled:
        Option<Arc<dyn Fn(Option<&Arc<Value>>, Option<&Arc<anyhow::Error>>, &Arc<Query>) + Send + Sync>>,
}

/// Keyed store owning [`Query`] lifetimes.
pub struct QueryCache {
    weak_self: std::sync::Weak<QueryCache>,
    queries: DashMap<String, Arc<Query>>,
    listeners: Listeners<CacheListener>,
    config: QueryCacheConfig,
}

impl QueryCache {
    /// An empty cache with default config.
    pub fn new() -> Arc<Self> {
        Self::with_config(QueryCacheConfig::default())
    }

    /// An empty cache with lifecycle hooks.
    pub fn with_config(config: QueryCacheConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            queries: DashMap::new(),
            listeners: Listeners::new(),
            config,
        })
    }

    /// Returns the query for these options, building it when absent.
    pub(crate) fn build(
        &self,
        options: Arc<QueryOptions>,
        state: Option<QueryState>,
    ) -> Arc<Query> {
        let hash = options.hash();
        if let Some(existing) = self.get(&hash) {
            return existing;
        }
        let query = Query::new(self.weak_self.clone(), options, state);
        self.add(Arc::clone(&query));
        query
    }

    pub(crate) fn add(&self, query: Arc<Query>) {
        let hash = query.query_hash().to_string();
        let added = !self.queries.contains_key(&hash);
        if added {
            debug!(query = %hash, "query added");
            self.queries.insert(hash, Arc::clone(&query));
            self.notify(QueryCacheEvent::Added(query));
        }
    }

    /// Removes `query`, cancelling its fetch and clearing its timers.
    pub fn remove(&self, query: &Arc<Query>) {
        let hash = query.query_hash().to_string();
        let in_map = self.queries.get(&hash).map(|q| Arc::clone(&q));
        if let Some(existing) = in_map {
            query.destroy();
            if Arc::ptr_eq(&existing, query) {
                self.queries.remove(&hash);
            }
            debug!(query = %hash, "query removed");
            self.notify(QueryCacheEvent::Removed(Arc::clone(query)));
        }
    }

    /// Looks up a query by canonical hash.
    pub fn get(&self, query_hash: &str) -> Option<Arc<Query>> {
        self.queries.get(query_hash).map(|q| Arc::clone(&q))
    }

    /// Every cached query.
    pub fn get_all(&self) -> Vec<Arc<Query>> {
        self.queries.iter().map(|q| Arc::clone(&q)).collect()
    }

    /// First query matching `filters`.
    pub fn find(&self, filters: &QueryFilters) -> Option<Arc<Query>> {
        self.get_all()
            .into_iter()
            .find(|q| filters.matches(q))
    }

    /// All queries matching `filters`.
    pub fn find_all(&self, filters: &QueryFilters) -> Vec<Arc<Query>> {
        self.get_all()
            .into_iter()
            .filter(|q| filters.matches(q))
            .collect()
    }

    /// Removes every query, batched.
    pub fn clear(&self) {
        notify_manager().batch(|| {
            for query in self.get_all() {
                self.remove(&query);
            }
        });
    }

    /// Subscribes to the event stream.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryCacheEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.listeners.subscribe(Arc::new(listener));
        let weak = self.weak_self.clone();
        Subscription::new(move || {
            if let Some(cache) = weak.upgrade() {
                cache.listeners.unsubscribe(id);
            }
        })
    }

    /// Emits `event` to all stream listeners inside a notification batch.
    pub(crate) fn notify(&self, event: QueryCacheEvent) {
        let event = Arc::new(event);
        notify_manager().batch(|| {
            for listener in self.listeners.snapshot() {
                let event = Arc::clone(&event);
                notify_manager().schedule(Box::new(move || listener(&event)));
            }
        });
    }

    /// Focus regained: broadcast to every query.
    pub(crate) fn on_focus(&self) {
        notify_manager().batch(|| {
            for query in self.get_all() {
                query.on_focus();
            }
        });
    }

    /// Connectivity regained: broadcast to every query.
    pub(crate) fn on_online(&self) {
        notify_manager().batch(|| {
            for query in self.get_all() {
                query.on_online();
            }
        });
    }

    pub(crate) fn run_success_hooks(&self, data: &Arc<Value>, query: &Arc<Query>) {
        if let Some(on_success) = &self.config.on_success {
            on_success(data, query);
        }
        if let Some(on_settled) = &self.config.on_settled {
            on_settled(Some(data), None, query);
        }
    }

    pub(crate) fn run_error_hooks(&self, error: &Arc<anyhow::Error>, query: &Arc<Query>) {
        if let Some(on_error) = &self.config.on_error {
            on_error(error, query);
        }
        if let Some(on_settled) = &self.config.on_settled {
            on_settled(None, Some(error), query);
        }
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("queries", &self.queries.len())
            .finish_non_exhaustive()
    }
}
