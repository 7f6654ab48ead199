//! Built-in cache event logger.
//!
//! Enabled via the `logging` feature. Useful for demos and debugging.

use std::sync::Arc;

use crate::listeners::Subscription;
use crate::mutation_cache::{MutationCache, MutationCacheEvent};
use crate::query_cache::{QueryCache, QueryCacheEvent};

/// Logs cache events to stdout.
pub struct EventLogger;

impl EventLogger {
    /// Attaches to a query cache's event stream.
    pub fn attach_queries(cache: &Arc<QueryCache>) -> Subscription {
        cache.subscribe(|event| match event {
            QueryCacheEvent::Added(query) => {
                println!("[added] query={}", query.query_hash());
            }
            QueryCacheEvent::Removed(query) => {
                println!("[removed] query={}", query.query_hash());
            }
            QueryCacheEvent::Updated { query, action } => {
                let state = query.state();
                println!(
                    "[updated] query={} action={:?} status={:?} fetch_status={:?}",
                    query.query_hash(),
                    action,
                    state.status,
                    state.fetch_status,
                );
            }
            QueryCacheEvent::ObserverAdded { query } => {
                println!(
                    "[observer-added] query={} observers={}",
                    query.query_hash(),
                    query.observers_count(),
                );
            }
            QueryCacheEvent::ObserverRemoved { query } => {
                println!(
                    "[observer-removed] query={} observers={}",
                    query.query_hash(),
                    query.observers_count(),
                );
            }
            QueryCacheEvent::ObserverResultsUpdated { query } => {
                println!("[observer-results] query={}", query.query_hash());
            }
            QueryCacheEvent::ObserverOptionsUpdated { query } => {
                println!("[observer-options] query={}", query.query_hash());
            }
        })
    }

    /// Attaches to a mutation cache's event stream.
    pub fn attach_mutations(cache: &Arc<MutationCache>) -> Subscription {
        cache.subscribe(|event| match event {
            MutationCacheEvent::Added(mutation) => {
                println!("[added] mutation={}", mutation.mutation_id());
            }
            MutationCacheEvent::Removed(mutation) => {
                println!("[removed] mutation={}", mutation.mutation_id());
            }
            MutationCacheEvent::Updated { mutation, action } => {
                println!(
                    "[updated] mutation={} action={:?} status={:?}",
                    mutation.mutation_id(),
                    action,
                    mutation.state().status,
                );
            }
            MutationCacheEvent::ObserverAdded { mutation } => {
                println!("[observer-added] mutation={}", mutation.mutation_id());
            }
            MutationCacheEvent::ObserverRemoved { mutation } => {
                println!("[observer-removed] mutation={}", mutation.mutation_id());
            }
            MutationCacheEvent::ObserverOptionsUpdated { mutation } => {
                println!("[observer-options] mutation={}", mutation.mutation_id());
            }
        })
    }
}
