//! # Store of mutations with per-scope serialization.
//!
//! [`MutationCache`] owns every [`Mutation`] and keeps an index
//! `scope id → ordered list`. Within a scope at most one mutation is
//! pending: [`MutationCache::can_run`] gates the head of the list and
//! [`MutationCache::run_next`] resumes the earliest paused sibling once the
//! current one settles.
//!
//! ```text
//! scope "x":  [ m1 (pending) | m2 (paused) | m3 (paused) ]
//!                    │ settles
//!                    └─► run_next ──► m2.continue_() ──► pending
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::filters::MutationFilters;
use crate::listeners::{Listeners, Subscription};
use crate::mutation::{Mutation, MutationAction, MutationState, MutationStatus};
use crate::notify::notify_manager;
use crate::options::{MutationErrorFn, MutationOptions, MutationSettledFn, MutationSuccessFn};
use crate::rt;

/// Events emitted on the mutation cache stream.
#[derive(Clone, Debug)]
pub enum MutationCacheEvent {
    /// A mutation entered the cache.
    Added(Arc<Mutation>),
    /// A mutation left the cache (or a removal was requested).
    Removed(Arc<Mutation>),
    /// A mutation state transition.
    Updated {
        /// The affected mutation.
        mutation: Arc<Mutation>,
        /// The reducer action that caused the transition.
        action: MutationAction,
    },
    /// An observer attached.
    ObserverAdded {
        /// The affected mutation.
        mutation: Arc<Mutation>,
    },
    /// An observer detached.
    ObserverRemoved {
        /// The affected mutation.
        mutation: Arc<Mutation>,
    },
    /// An observer changed its options.
    ObserverOptionsUpdated {
        /// The affected mutation.
        mutation: Arc<Mutation>,
    },
}

type MutationCacheListener = dyn Fn(&MutationCacheEvent) + Send + Sync;

/// Hook run before every mutation function (cache layer of `on_mutate`).
pub type CacheMutateFn =
    Arc<dyn Fn(Arc<Value>) -> BoxFuture<'static, Result<(), anyhow::Error>> + Send + Sync>;

/// Cache-level mutation lifecycle hooks, layered before option-level ones.
#[derive(Clone, Default)]
pub struct MutationCacheConfig {
    /// Runs before every mutation function.
    pub on_mutate: Option<CacheMutateFn>,
    /// Runs after every successful mutation.
    pub on_success: Option<MutationSuccessFn>,
    /// Runs after every failed mutation (best effort).
    pub on_error: Option<MutationErrorFn>,
    /// Runs after every settled mutation.
    pub on_settled: Option<MutationSettledFn>,
}

/// Ordered store of mutations plus the scope index.
pub struct MutationCache {
    weak_self: std::sync::Weak<MutationCache>,
    mutations: Mutex<Vec<Arc<Mutation>>>,
    scopes: Mutex<HashMap<String, Vec<Arc<Mutation>>>>,
    next_id: AtomicU64,
    listeners: Listeners<MutationCacheListener>,
    config: MutationCacheConfig,
}

impl MutationCache {
    /// An empty cache with default config.
    pub fn new() -> Arc<Self> {
        Self::with_config(MutationCacheConfig::default())
    }

    /// An empty cache with lifecycle hooks.
    pub fn with_config(config: MutationCacheConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            mutations: Mutex::new(Vec::new()),
            scopes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            listeners: Listeners::new(),
            config,
        })
    }

    /// Builds a new mutation owned by this cache.
    pub(crate) fn build(
        &self,
        options: Arc<MutationOptions>,
        state: Option<MutationState>,
    ) -> Arc<Mutation> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mutation = Mutation::new(self.weak_self.clone(), id, options, state);
        self.add(Arc::clone(&mutation));
        mutation
    }

    pub(crate) fn add(&self, mutation: Arc<Mutation>) {
        self.mutations.lock().push(Arc::clone(&mutation));
        if let Some(scope) = mutation.scope_id() {
            self.scopes
                .lock()
                .entry(scope)
                .or_default()
                .push(Arc::clone(&mutation));
        }
        debug!(mutation = mutation.mutation_id(), "mutation added");
        self.notify(MutationCacheEvent::Added(mutation));
    }

    /// Removes `mutation` from the store and its scope list.
    ///
    /// The removal event is emitted even when the mutation was already
    /// absent: the stream mirrors the call, not the store contents.
    pub fn remove(&self, mutation: &Arc<Mutation>) {
        self.mutations
            .lock()
            .retain(|m| !Arc::ptr_eq(m, mutation));
        if let Some(scope) = mutation.scope_id() {
            let mut scopes = self.scopes.lock();
            if let Some(list) = scopes.get_mut(&scope) {
                list.retain(|m| !Arc::ptr_eq(m, mutation));
                if list.is_empty() {
                    scopes.remove(&scope);
                }
            }
        }
        self.notify(MutationCacheEvent::Removed(Arc::clone(mutation)));
    }

    /// Whether `mutation` may run now: unscoped mutations always may; a
    /// scoped one only when it is the earliest unsettled entry of its scope
    /// (execution follows enqueue order).
    pub fn can_run(&self, mutation: &Arc<Mutation>) -> bool {
        let Some(scope) = mutation.scope_id() else {
            return true;
        };
        let scopes = self.scopes.lock();
        let head = scopes.get(&scope).and_then(|list| {
            list.iter()
                .find(|m| {
                    matches!(
                        m.state().status,
                        MutationStatus::Idle | MutationStatus::Pending
                    )
                })
                .cloned()
        });
        match head {
            None => true,
            Some(head) => Arc::ptr_eq(&head, mutation),
        }
    }

    /// Resumes the earliest paused sibling in `mutation`'s scope.
    pub(crate) fn run_next(&self, mutation: &Arc<Mutation>) {
        let Some(scope) = mutation.scope_id() else {
            return;
        };
        let next = {
            let scopes = self.scopes.lock();
            scopes.get(&scope).and_then(|list| {
                list.iter()
                    .find(|m| !Arc::ptr_eq(m, mutation) && m.state().is_paused)
                    .cloned()
            })
        };
        if let Some(next) = next {
            rt::spawn(async move {
                let _ = next.continue_().await;
            });
        }
    }

    /// Resumes every currently paused mutation; resolves when all their
    /// continuation chains settled. Errors are swallowed.
    pub async fn resume_paused_mutations(&self) {
        let paused: Vec<Arc<Mutation>> = self
            .mutations
            .lock()
            .iter()
            .filter(|m| m.state().is_paused)
            .cloned()
            .collect();
        let continuations: Vec<_> = notify_manager().batch(|| {
            paused
                .into_iter()
                .map(|m| m.continue_().map(|_| ()))
                .collect()
        });
        futures::future::join_all(continuations).await;
    }

    /// Every stored mutation in insertion order.
    pub fn get_all(&self) -> Vec<Arc<Mutation>> {
        self.mutations.lock().clone()
    }

    /// First mutation matching `filters`.
    pub fn find(&self, filters: &MutationFilters) -> Option<Arc<Mutation>> {
        self.get_all().into_iter().find(|m| filters.matches(m))
    }

    /// All mutations matching `filters`.
    pub fn find_all(&self, filters: &MutationFilters) -> Vec<Arc<Mutation>> {
        self.get_all()
            .into_iter()
            .filter(|m| filters.matches(m))
            .collect()
    }

    /// Removes every mutation, batched.
    pub fn clear(&self) {
        notify_manager().batch(|| {
            for mutation in self.get_all() {
                self.remove(&mutation);
            }
        });
    }

    /// Subscribes to the event stream.
    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationCacheEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.listeners.subscribe(Arc::new(listener));
        let weak = self.weak_self.clone();
        Subscription::new(move || {
            if let Some(cache) = weak.upgrade() {
                cache.listeners.unsubscribe(id);
            }
        })
    }

    pub(crate) fn notify(&self, event: MutationCacheEvent) {
        let event = Arc::new(event);
        notify_manager().batch(|| {
            for listener in self.listeners.snapshot() {
                let event = Arc::clone(&event);
                notify_manager().schedule(Box::new(move || listener(&event)));
            }
        });
    }

    pub(crate) async fn run_mutate_hook(&self, variables: &Arc<Value>) -> Result<(), anyhow::Error> {
        if let Some(on_mutate) = &self.config.on_mutate {
            on_mutate(Arc::clone(variables)).await?;
        }
        Ok(())
    }

    pub(crate) async fn run_success_hooks(
        &self,
        data: &Arc<Value>,
        variables: &Arc<Value>,
        context: &Option<Arc<Value>>,
    ) -> Result<(), anyhow::Error> {
        if let Some(on_success) = &self.config.on_success {
            on_success(Arc::clone(data), Arc::clone(variables), context.clone()).await?;
        }
        if let Some(on_settled) = &self.config.on_settled {
            on_settled(
                Some(Arc::clone(data)),
                None,
                Arc::clone(variables),
                context.clone(),
            )
            .await?;
        }
        Ok(())
    }

    pub(crate) async fn run_error_hooks(
        &self,
        error: &Arc<anyhow::Error>,
        variables: &Arc<Value>,
        context: &Option<Arc<Value>>,
    ) {
        if let Some(on_error) = &self.config.on_error {
            let _ = on_error(Arc::clone(error), Arc::clone(variables), context.clone()).await;
        }
        if let Some(on_settled) = &self.config.on_settled {
            let _ = on_settled(
                None,
                Some(Arc::clone(error)),
                Arc::clone(variables),
                context.clone(),
            )
            .await;
        }
    }
}

impl std::fmt::Debug for MutationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationCache")
            .field("mutations", &self.mutations.lock().len())
            .field("scopes", &self.scopes.lock().len())
            .finish_non_exhaustive()
    }
}
