//! # Dehydration and hydration of cache state.
//!
//! [`dehydrate`] produces a serializable snapshot of the cache (successful
//! queries and paused mutations by default); [`hydrate`] rebuilds entries on
//! another client without triggering fetches. A [`Persister`] collaborator
//! moves snapshots in and out of storage; the engine treats persistence as
//! best-effort.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::client::QueryClient;
use crate::key::QueryKey;
use crate::mutation::{Mutation, MutationState, MutationStatus};
use crate::notify::notify_manager;
use crate::options::{MutationOptions, QueryOptions};
use crate::query::{FetchStatus, Query, QueryState, QueryStatus};

/// Serialized form of one query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DehydratedQuery {
    /// Canonical hash the entry was stored under.
    pub query_hash: String,
    /// The entry's key.
    pub query_key: QueryKey,
    /// Cached payload.
    pub data: Option<Value>,
    /// Epoch ms of the last data write.
    pub data_updated_at: u64,
    /// Outcome axis at dehydration time.
    pub status: QueryStatus,
}

/// Serialized form of one mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DehydratedMutation {
    /// Key used for default matching on restore.
    pub mutation_key: Option<QueryKey>,
    /// Scope identifier.
    pub scope_id: Option<String>,
    /// Variables the mutation ran with.
    pub variables: Option<Value>,
    /// Context from `on_mutate`.
    pub context: Option<Value>,
    /// Result payload, when settled.
    pub data: Option<Value>,
    /// Failure count at dehydration time.
    pub failure_count: u32,
    /// Whether the mutation was paused.
    pub is_paused: bool,
    /// Lifecycle position.
    pub status: MutationStatus,
    /// Epoch ms of submission.
    pub submitted_at: u64,
}

/// Serializable snapshot of a client's caches.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DehydratedState {
    /// Exported queries.
    pub queries: Vec<DehydratedQuery>,
    /// Exported mutations.
    pub mutations: Vec<DehydratedMutation>,
}

/// Export predicates.
#[derive(Clone, Default)]
pub struct DehydrateOptions {
    /// Which queries to export (default: successful ones).
    pub should_dehydrate_query: Option<Arc<dyn Fn(&Arc<Query>) -> bool + Send + Sync>>,
    /// Which mutations to export (default: paused ones).
    pub should_dehydrate_mutation: Option<Arc<dyn Fn(&Arc<Mutation>) -> bool + Send + Sync>>,
}

/// Produces a serializable snapshot of `client`'s caches.
pub fn dehydrate(client: &Arc<QueryClient>, options: &DehydrateOptions) -> DehydratedState {
    let queries = client
        .query_cache()
        .get_all()
        .into_iter()
        .filter(|query| match &options.should_dehydrate_query {
            Some(predicate) => predicate(query),
            None => query.state().status == QueryStatus::Success,
        })
        .map(|query| {
            let state = query.state();
            DehydratedQuery {
                query_hash: query.query_hash().to_string(),
                query_key: query.query_key().clone(),
                data: state.data.as_deref().cloned(),
                data_updated_at: state.data_updated_at,
                status: state.status,
            }
        })
        .collect();

    let mutations = client
        .mutation_cache()
        .get_all()
        .into_iter()
        .filter(|mutation| match &options.should_dehydrate_mutation {
            Some(predicate) => predicate(mutation),
            None => mutation.state().is_paused,
        })
        .map(|mutation| {
            let state = mutation.state();
            let opts = mutation.options();
            DehydratedMutation {
                mutation_key: opts.mutation_key.clone(),
                scope_id: opts.scope_id.clone(),
                variables: state.variables.as_deref().cloned(),
                context: state.context.as_deref().cloned(),
                data: state.data.as_deref().cloned(),
                failure_count: state.failure_count,
                is_paused: state.is_paused,
                status: state.status,
                submitted_at: state.submitted_at,
            }
        })
        .collect();

    DehydratedState { queries, mutations }
}

/// Rebuilds cache entries from `snapshot` without triggering fetches.
/// Existing entries with newer data win over the snapshot.
pub fn hydrate(client: &Arc<QueryClient>, snapshot: &DehydratedState) {
    notify_manager().batch(|| {
        for dehydrated in &snapshot.queries {
            let state = QueryState {
                data: dehydrated.data.clone().map(Arc::new),
                data_updated_at: dehydrated.data_updated_at,
                status: dehydrated.status,
                fetch_status: FetchStatus::Idle,
                ..QueryState::default()
            };
            if let Some(existing) = client.query_cache().get(&dehydrated.query_hash) {
                if existing.state().data_updated_at < dehydrated.data_updated_at {
                    existing.set_state(state);
                }
                continue;
            }
            let mut options = QueryOptions::new(dehydrated.query_key.clone());
            options.query_hash = Some(dehydrated.query_hash.clone());
            let defaulted = client.default_query_options(options);
            client.query_cache().build(defaulted, Some(state));
        }

        for dehydrated in &snapshot.mutations {
            let mut options = MutationOptions::new();
            options.mutation_key = dehydrated.mutation_key.clone();
            options.scope_id = dehydrated.scope_id.clone();
            let defaulted = client.default_mutation_options(options);
            let state = MutationState {
                data: dehydrated.data.clone().map(Arc::new),
                error: None,
                variables: dehydrated.variables.clone().map(Arc::new),
                context: dehydrated.context.clone().map(Arc::new),
                failure_count: dehydrated.failure_count,
                failure_reason: None,
                is_paused: dehydrated.is_paused,
                status: dehydrated.status,
                submitted_at: dehydrated.submitted_at,
            };
            client.mutation_cache().build(defaulted, Some(state));
        }
    });
    debug!(
        queries = snapshot.queries.len(),
        mutations = snapshot.mutations.len(),
        "hydrated"
    );
}

/// Storage collaborator for cache snapshots.
#[async_trait]
pub trait Persister: Send + Sync {
    /// Writes a snapshot to storage.
    async fn persist_client(&self, state: &DehydratedState) -> anyhow::Result<()>;

    /// Reads the stored snapshot, if any.
    async fn restore_client(&self) -> anyhow::Result<Option<DehydratedState>>;

    /// Drops the stored snapshot.
    async fn remove_client(&self) -> anyhow::Result<()>;
}

/// Persists the current cache state through `persister`, best-effort.
pub async fn persist_client_state(client: &Arc<QueryClient>, persister: &dyn Persister) {
    let snapshot = dehydrate(client, &DehydrateOptions::default());
    if let Err(error) = persister.persist_client(&snapshot).await {
        debug!(%error, "persist failed");
    }
}

/// Restores cache state through `persister`, best-effort.
pub async fn restore_client_state(client: &Arc<QueryClient>, persister: &dyn Persister) {
    match persister.restore_client().await {
        Ok(Some(snapshot)) => hydrate(client, &snapshot),
        Ok(None) => {}
        Err(error) => debug!(%error, "restore failed"),
    }
}
