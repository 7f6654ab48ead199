//! # Match predicates for bulk cache operations.
//!
//! [`QueryFilters`] and [`MutationFilters`] select entries for the client's
//! bulk operations (`invalidate_queries`, `refetch_queries`,
//! `cancel_queries`, `is_fetching`, ...). Key matching is exact or partial
//! (prefix with partial object containment, see
//! [`partial_match_key`](crate::key::partial_match_key)).

use std::sync::Arc;

use crate::key::{QueryKey, hash_query_key, partial_match_key};
use crate::mutation::{Mutation, MutationStatus};
use crate::query::{FetchStatus, Query};

/// Which observation states a query filter selects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueryTypeFilter {
    /// Observed and enabled.
    Active,
    /// Not observed, or observed only by disabled observers.
    Inactive,
    /// Everything (default).
    #[default]
    All,
}

/// Predicate over cached queries.
#[derive(Clone, Default)]
pub struct QueryFilters {
    /// Match against this key; partial by default.
    pub query_key: Option<QueryKey>,
    /// Require the full canonical hash to match.
    pub exact: bool,
    /// Restrict by observation state.
    pub query_type: QueryTypeFilter,
    /// Restrict by staleness.
    pub stale: Option<bool>,
    /// Restrict by execution state.
    pub fetch_status: Option<FetchStatus>,
    /// Arbitrary predicate, applied last.
    pub predicate: Option<Arc<dyn Fn(&Arc<Query>) -> bool + Send + Sync>>,
}

impl QueryFilters {
    /// Filters matching `query_key` partially.
    pub fn key(query_key: QueryKey) -> Self {
        Self {
            query_key: Some(query_key),
            ..Self::default()
        }
    }

    /// Filters matching `query_key` exactly.
    pub fn key_exact(query_key: QueryKey) -> Self {
        Self {
            query_key: Some(query_key),
            exact: true,
            ..Self::default()
        }
    }

    pub fn with_type(mut self, query_type: QueryTypeFilter) -> Self {
        self.query_type = query_type;
        self
    }

    pub fn with_stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    pub fn with_fetch_status(mut self, fetch_status: FetchStatus) -> Self {
        self.fetch_status = Some(fetch_status);
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Arc<Query>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Whether `query` passes every configured restriction.
    pub fn matches(&self, query: &Arc<Query>) -> bool {
        if let Some(key) = &self.query_key {
            if self.exact {
                // Honor a per-query hash override when comparing exactly.
                let hash = match &query.options().query_key_hash_fn {
                    Some(hash_fn) => hash_fn(key),
                    None => hash_query_key(key),
                };
                if query.query_hash() != hash {
                    return false;
                }
            } else if !partial_match_key(query.query_key(), key) {
                return false;
            }
        }
        match self.query_type {
            QueryTypeFilter::All => {}
            QueryTypeFilter::Active => {
                if !query.is_active() {
                    return false;
                }
            }
            QueryTypeFilter::Inactive => {
                if query.is_active() {
                    return false;
                }
            }
        }
        if let Some(stale) = self.stale {
            if query.is_stale() != stale {
                return false;
            }
        }
        if let Some(fetch_status) = self.fetch_status {
            if query.state().fetch_status != fetch_status {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(query) {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for QueryFilters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryFilters")
            .field("query_key", &self.query_key)
            .field("exact", &self.exact)
            .field("query_type", &self.query_type)
            .field("stale", &self.stale)
            .field("fetch_status", &self.fetch_status)
            .finish_non_exhaustive()
    }
}

/// Predicate over cached mutations.
#[derive(Clone, Default)]
pub struct MutationFilters {
    /// Match against this mutation key; partial by default.
    pub mutation_key: Option<QueryKey>,
    /// Require the full key hash to match.
    pub exact: bool,
    /// Restrict by status.
    pub status: Option<MutationStatus>,
    /// Arbitrary predicate, applied last.
    pub predicate: Option<Arc<dyn Fn(&Arc<Mutation>) -> bool + Send + Sync>>,
}

impl MutationFilters {
    /// Filters matching `mutation_key` partially.
    pub fn key(mutation_key: QueryKey) -> Self {
        Self {
            mutation_key: Some(mutation_key),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: MutationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Arc<Mutation>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Whether `mutation` passes every configured restriction.
    pub fn matches(&self, mutation: &Arc<Mutation>) -> bool {
        if let Some(key) = &self.mutation_key {
            let Some(mutation_key) = mutation.options().mutation_key.clone() else {
                return false;
            };
            if self.exact {
                if hash_query_key(&mutation_key) != hash_query_key(key) {
                    return false;
                }
            } else if !partial_match_key(&mutation_key, key) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if mutation.state().status != status {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(mutation) {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for MutationFilters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationFilters")
            .field("mutation_key", &self.mutation_key)
            .field("exact", &self.exact)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
