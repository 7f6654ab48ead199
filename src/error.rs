//! # Error types used by the queryvisor engine.
//!
//! This module defines two main error types:
//!
//! - [`CancelledError`] the cooperative cancellation signal carried through
//!   fetch promises.
//! - [`EngineError`] configuration failures raised by the engine itself.
//!
//! User-supplied fetch and mutate functions report failures as plain
//! [`anyhow::Error`] values; the engine stores them behind `Arc` so state
//! snapshots stay cheaply cloneable. [`CancelledError`] is distinguished from
//! ordinary fetch errors by downcast.

use thiserror::Error;

/// Options accepted by the cancellation entry points
/// (`Query::cancel`, `QueryClient::cancel_queries`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CancelOptions {
    /// Restore the state captured before the cancelled fetch started.
    pub revert: bool,
    /// Suppress observer notification of the cancelled transition.
    pub silent: bool,
}

impl CancelOptions {
    /// Cancellation that rolls state back to the pre-fetch snapshot.
    pub fn revert() -> Self {
        Self {
            revert: true,
            silent: false,
        }
    }

    /// Cancellation that leaves state untouched and notifies nobody.
    ///
    /// Used internally when a fetch is replaced by a newer one.
    pub fn silent() -> Self {
        Self {
            revert: false,
            silent: true,
        }
    }
}

/// # Cancellation signal for an in-flight fetch.
///
/// Rejections carrying this type are **not errors** in the traditional
/// sense: they mark intentional termination. `revert` asks the owning query
/// to restore its pre-fetch data snapshot; `silent` suppresses the observer
/// notification for the intermediate transition.
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[error("fetch cancelled (revert: {revert}, silent: {silent})")]
pub struct CancelledError {
    /// Whether the owner should restore the pre-fetch snapshot.
    pub revert: bool,
    /// Whether observers should not be notified of the transition.
    pub silent: bool,
}

impl From<CancelOptions> for CancelledError {
    fn from(opts: CancelOptions) -> Self {
        Self {
            revert: opts.revert,
            silent: opts.silent,
        }
    }
}

/// Returns the [`CancelledError`] carried by `error`, if any.
pub fn cancelled(error: &anyhow::Error) -> Option<&CancelledError> {
    error.downcast_ref::<CancelledError>()
}

/// # Errors produced by the engine itself.
///
/// These represent misconfiguration, not failures of user fetch functions.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EngineError {
    /// A fetch was requested for a query that has no query function.
    #[error("no query function configured for query '{query_hash}'")]
    MissingQueryFn {
        /// Canonical hash of the affected query.
        query_hash: String,
    },

    /// A query function was set to the skip sentinel but fetched anyway.
    #[error("query '{query_hash}' is disabled by its skip sentinel")]
    SkippedQueryFn {
        /// Canonical hash of the affected query.
        query_hash: String,
    },

    /// A mutation was executed without a mutation function.
    #[error("no mutation function configured")]
    MissingMutationFn,

    /// An async operation required a tokio runtime and none was available.
    #[error("operation requires an ambient tokio runtime")]
    NoRuntime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_error_is_detected_by_downcast() {
        let err = anyhow::Error::new(CancelledError {
            revert: true,
            silent: false,
        });
        let c = cancelled(&err).expect("should downcast");
        assert!(c.revert);
        assert!(!c.silent);

        let plain = anyhow::anyhow!("boom");
        assert!(cancelled(&plain).is_none());
    }

    #[test]
    fn cancel_options_convert() {
        let c: CancelledError = CancelOptions::silent().into();
        assert!(c.silent);
        assert!(!c.revert);
    }
}
