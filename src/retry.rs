//! # Single-flight fetch execution with retry, backoff, and pausing.
//!
//! [`Retryer`] drives one attempt sequence for a query fetch or mutation:
//!
//! ```text
//! start()
//!   │
//!   ├─► gate: can_fetch(network_mode) && can_run()  ──false──► pause
//!   ▼
//! loop {
//!   ├─► run attempt (select: fetch future | cancellation)
//!   ├─► Ok(value)  → on_success → resolve shared promise
//!   └─► Err(error) → retry policy?
//!         ├─► denied / retry-cancelled → on_error → reject shared promise
//!         └─► allowed → failure += 1 → on_fail
//!               → sleep(retry_delay) (cancellable)
//!               → can_continue()? ──false──► pause (await focus/online)
//! }
//! ```
//!
//! ## Rules
//! - Attempts run **sequentially**; one Retryer owns one attempt chain.
//! - The external promise is shared: every caller of the same in-flight
//!   fetch awaits the same resolution.
//! - `pause` resolves only when a continuation arrives **and** the
//!   continuation is still valid (focused, connectivity per network mode,
//!   `can_run` for scope serialization).
//! - Cancellation rejects with [`CancelledError`] carrying the cancel
//!   options and fires the abort signal handed to the fetch function.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{CancelOptions, CancelledError, cancelled};
use crate::focus::focus_manager;
use crate::online::online_manager;
use crate::rt;

/// Resolution of one fetch attempt chain.
pub type FetchResult = Result<Arc<Value>, Arc<anyhow::Error>>;

/// Producer of one fetch attempt.
pub(crate) type AttemptFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Value, anyhow::Error>> + Send + Sync>;

/// Connectivity gating for fetches and retries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetworkMode {
    /// Fetches and retries require connectivity (default).
    #[default]
    Online,
    /// Connectivity is ignored entirely.
    Always,
    /// The first attempt always runs; retries respect connectivity.
    OfflineFirst,
}

/// Whether a fetch may start under `mode` right now.
pub(crate) fn can_fetch(mode: NetworkMode) -> bool {
    match mode {
        NetworkMode::Online => online_manager().is_online(),
        NetworkMode::Always | NetworkMode::OfflineFirst => true,
    }
}

/// Whether a failed attempt should be retried.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Never retry.
    Never,
    /// Retry up to `n` times.
    Count(u32),
    /// Retry without bound.
    Always,
    /// Decide per failure from `(failure_count, error)`.
    Predicate(Arc<dyn Fn(u32, &anyhow::Error) -> bool + Send + Sync>),
}

impl Default for RetryPolicy {
    /// Three retries.
    fn default() -> Self {
        RetryPolicy::Count(3)
    }
}

impl RetryPolicy {
    pub(crate) fn should_retry(&self, failure_count: u32, error: &anyhow::Error) -> bool {
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::Count(n) => failure_count < *n,
            RetryPolicy::Always => true,
            RetryPolicy::Predicate(f) => f(failure_count, error),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryPolicy::Never => f.write_str("RetryPolicy::Never"),
            RetryPolicy::Count(n) => write!(f, "RetryPolicy::Count({n})"),
            RetryPolicy::Always => f.write_str("RetryPolicy::Always"),
            RetryPolicy::Predicate(_) => f.write_str("RetryPolicy::Predicate(..)"),
        }
    }
}

impl From<bool> for RetryPolicy {
    fn from(retry: bool) -> Self {
        if retry {
            RetryPolicy::Always
        } else {
            RetryPolicy::Never
        }
    }
}

impl From<u32> for RetryPolicy {
    fn from(count: u32) -> Self {
        RetryPolicy::Count(count)
    }
}

/// Delay between a failure and the next attempt.
#[derive(Clone)]
pub enum RetryDelay {
    /// `min(base · 2^failure_count, max)`.
    Backoff {
        /// Delay before the first retry.
        base: Duration,
        /// Maximum delay cap.
        max: Duration,
    },
    /// Constant delay.
    Fixed(Duration),
    /// Computed per failure from `(failure_count, error)`.
    Custom(Arc<dyn Fn(u32, &anyhow::Error) -> Duration + Send + Sync>),
}

impl Default for RetryDelay {
    /// Exponential backoff starting at 1s, capped at 30s.
    fn default() -> Self {
        RetryDelay::Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl RetryDelay {
    pub(crate) fn delay(&self, failure_count: u32, error: &anyhow::Error) -> Duration {
        match self {
            RetryDelay::Backoff { base, max } => {
                let factor = 1u64 << failure_count.min(20);
                let millis = (base.as_millis() as u64).saturating_mul(factor);
                Duration::from_millis(millis).min(*max)
            }
            RetryDelay::Fixed(d) => *d,
            RetryDelay::Custom(f) => f(failure_count, error),
        }
    }
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryDelay::Backoff { base, max } => f
                .debug_struct("RetryDelay::Backoff")
                .field("base", base)
                .field("max", max)
                .finish(),
            RetryDelay::Fixed(d) => write!(f, "RetryDelay::Fixed({d:?})"),
            RetryDelay::Custom(_) => f.write_str("RetryDelay::Custom(..)"),
        }
    }
}

/// Owner callbacks invoked from the attempt loop.
#[derive(Default)]
pub(crate) struct RetryerCallbacks {
    pub on_success: Option<Box<dyn Fn(&Arc<Value>) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(&Arc<anyhow::Error>) + Send + Sync>>,
    pub on_fail: Option<Box<dyn Fn(u32, &Arc<anyhow::Error>) + Send + Sync>>,
    pub on_pause: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_continue: Option<Box<dyn Fn() + Send + Sync>>,
}

/// Configuration for one attempt chain.
pub(crate) struct RetryerConfig {
    pub fetch_fn: AttemptFn,
    /// Continuation promise awaited instead of the first attempt.
    pub initial_promise: Option<BoxFuture<'static, Result<Value, anyhow::Error>>>,
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
    pub network_mode: NetworkMode,
    /// Scope-serialization gate supplied by the owner.
    pub can_run: Arc<dyn Fn() -> bool + Send + Sync>,
    /// Seed for continuation after a process-level resume.
    pub initial_failure_count: u32,
    pub callbacks: RetryerCallbacks,
}

struct RetryerState {
    failure_count: AtomicU32,
    is_paused: AtomicBool,
    is_resolved: AtomicBool,
    is_retry_cancelled: AtomicBool,
    cancel_options: Mutex<Option<CancelOptions>>,
    network_mode: NetworkMode,
    can_run: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl RetryerState {
    fn cancelled_error(&self) -> Arc<anyhow::Error> {
        let opts = self.cancel_options.lock().unwrap_or_default();
        Arc::new(anyhow::Error::new(CancelledError::from(opts)))
    }

    fn can_continue(&self) -> bool {
        focus_manager().is_focused()
            && (self.network_mode == NetworkMode::Always || online_manager().is_online())
            && (self.can_run)()
    }
}

/// Handle over a spawned attempt chain. Cloning shares the same chain.
#[derive(Clone)]
pub(crate) struct Retryer {
    promise: Shared<BoxFuture<'static, FetchResult>>,
    state: Arc<RetryerState>,
    cancel_token: CancellationToken,
    signal: CancellationToken,
    start_sig: Arc<Notify>,
    continue_sig: Arc<Notify>,
}

impl Retryer {
    /// Spawns the attempt chain. It stays dormant until [`Retryer::start`].
    ///
    /// `signal` is the abort token handed to the user fetch function; it is
    /// cancelled together with the chain.
    pub fn spawn(config: RetryerConfig, signal: CancellationToken) -> Self {
        let (tx, rx) = oneshot::channel::<FetchResult>();
        let promise = rx
            .map(|res| match res {
                Ok(result) => result,
                // The task was dropped without settling (runtime shutdown).
                Err(_) => Err(Arc::new(anyhow::Error::new(CancelledError::default()))),
            })
            .boxed()
            .shared();

        let state = Arc::new(RetryerState {
            failure_count: AtomicU32::new(config.initial_failure_count),
            is_paused: AtomicBool::new(false),
            is_resolved: AtomicBool::new(false),
            is_retry_cancelled: AtomicBool::new(false),
            cancel_options: Mutex::new(None),
            network_mode: config.network_mode,
            can_run: Arc::clone(&config.can_run),
        });

        let retryer = Self {
            promise,
            state: Arc::clone(&state),
            cancel_token: CancellationToken::new(),
            signal,
            start_sig: Arc::new(Notify::new()),
            continue_sig: Arc::new(Notify::new()),
        };

        let task = run_attempts(
            config,
            state,
            retryer.cancel_token.clone(),
            Arc::clone(&retryer.start_sig),
            Arc::clone(&retryer.continue_sig),
            tx,
        );
        if rt::spawn(task).is_none() {
            // Without a runtime nothing can drive the chain; settle as
            // cancelled so awaiters do not hang.
            retryer.cancel_token.cancel();
        }

        retryer
    }

    /// Releases the dormant chain. Idempotent.
    pub fn start(&self) {
        self.start_sig.notify_one();
    }

    /// Shared promise resolving with the chain's outcome.
    pub fn promise(&self) -> Shared<BoxFuture<'static, FetchResult>> {
        self.promise.clone()
    }

    /// Rejects the chain with a [`CancelledError`] carrying `options`
    /// (unless already resolved) and fires the abort signal.
    pub fn cancel(&self, options: CancelOptions) {
        if !self.state.is_resolved.load(Ordering::SeqCst) {
            *self.state.cancel_options.lock() = Some(options);
        }
        self.signal.cancel();
        self.cancel_token.cancel();
    }

    /// Suppresses further retries; the next failure rejects.
    pub fn cancel_retry(&self) {
        self.state.is_retry_cancelled.store(true, Ordering::SeqCst);
    }

    /// Re-enables retries after [`Retryer::cancel_retry`].
    pub fn continue_retry(&self) {
        self.state.is_retry_cancelled.store(false, Ordering::SeqCst);
    }

    /// Wakes a paused chain; it re-checks its continuation conditions.
    pub fn resume(&self) {
        self.continue_sig.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> u32 {
        self.state.failure_count.load(Ordering::SeqCst)
    }
}

async fn run_attempts(
    config: RetryerConfig,
    state: Arc<RetryerState>,
    cancel: CancellationToken,
    start_sig: Arc<Notify>,
    continue_sig: Arc<Notify>,
    tx: oneshot::Sender<FetchResult>,
) {
    let RetryerConfig {
        fetch_fn,
        mut initial_promise,
        retry,
        retry_delay,
        network_mode,
        callbacks,
        ..
    } = config;

    let settle = |result: FetchResult, tx: oneshot::Sender<FetchResult>| {
        state.is_resolved.store(true, Ordering::SeqCst);
        match &result {
            Ok(value) => {
                if let Some(cb) = &callbacks.on_success {
                    cb(value);
                }
            }
            Err(error) => {
                if let Some(cb) = &callbacks.on_error {
                    cb(error);
                }
            }
        }
        let _ = tx.send(result);
    };

    // Dormant until the owner releases the chain.
    tokio::select! {
        _ = start_sig.notified() => {}
        _ = cancel.cancelled() => {
            settle(Err(state.cancelled_error()), tx);
            return;
        }
    }

    // Initial gate: paused straight away when offline or blocked by scope.
    if !(can_fetch(network_mode) && (state.can_run)()) {
        if let Err(error) = pause_until_continue(&state, &callbacks, &continue_sig, &cancel).await {
            settle(Err(error), tx);
            return;
        }
    }

    loop {
        let attempt = match initial_promise.take() {
            Some(continuation) => continuation,
            None => (fetch_fn)(),
        };

        let result: FetchResult = tokio::select! {
            res = attempt => res.map(Arc::new).map_err(Arc::new),
            _ = cancel.cancelled() => Err(state.cancelled_error()),
        };

        match result {
            Ok(value) => {
                settle(Ok(value), tx);
                return;
            }
            Err(error) => {
                if state.is_resolved.load(Ordering::SeqCst) {
                    return;
                }
                if cancel.is_cancelled() || cancelled(&error).is_some() {
                    settle(Err(error), tx);
                    return;
                }

                let failures = state.failure_count.load(Ordering::SeqCst);
                let denied = state.is_retry_cancelled.load(Ordering::SeqCst)
                    || !retry.should_retry(failures, &error);
                if denied {
                    settle(Err(error), tx);
                    return;
                }

                let delay = retry_delay.delay(failures, &error);
                let failures = failures + 1;
                state.failure_count.store(failures, Ordering::SeqCst);
                if let Some(cb) = &callbacks.on_fail {
                    cb(failures, &error);
                }
                trace!(failures, ?delay, "retry scheduled");

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        settle(Err(state.cancelled_error()), tx);
                        return;
                    }
                }

                if !state.can_continue() {
                    if let Err(error) =
                        pause_until_continue(&state, &callbacks, &continue_sig, &cancel).await
                    {
                        settle(Err(error), tx);
                        return;
                    }
                }
            }
        }
    }
}

async fn pause_until_continue(
    state: &RetryerState,
    callbacks: &RetryerCallbacks,
    continue_sig: &Notify,
    cancel: &CancellationToken,
) -> Result<(), Arc<anyhow::Error>> {
    state.is_paused.store(true, Ordering::SeqCst);
    if let Some(cb) = &callbacks.on_pause {
        cb();
    }
    loop {
        tokio::select! {
            _ = continue_sig.notified() => {
                // Only a still-valid continuation releases the pause.
                if state.can_continue() {
                    break;
                }
            }
            _ = cancel.cancelled() => {
                state.is_paused.store(false, Ordering::SeqCst);
                return Err(state.cancelled_error());
            }
        }
    }
    state.is_paused.store(false, Ordering::SeqCst);
    if let Some(cb) = &callbacks.on_continue {
        cb();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_fn(failures_before_success: usize, calls: Arc<AtomicUsize>) -> AttemptFn {
        Arc::new(move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < failures_before_success {
                    Err(anyhow::anyhow!("transient #{n}"))
                } else {
                    Ok(serde_json::json!({"attempt": n}))
                }
            }
            .boxed()
        })
    }

    fn config(fetch_fn: AttemptFn, retry: RetryPolicy) -> RetryerConfig {
        RetryerConfig {
            fetch_fn,
            initial_promise: None,
            retry,
            retry_delay: RetryDelay::Fixed(Duration::from_millis(10)),
            network_mode: NetworkMode::Always,
            can_run: Arc::new(|| true),
            initial_failure_count: 0,
            callbacks: RetryerCallbacks::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retryer = Retryer::spawn(
            config(counting_fn(2, Arc::clone(&calls)), RetryPolicy::Count(3)),
            CancellationToken::new(),
        );
        retryer.start();
        let result = retryer.promise().await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retryer.failure_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_never_rejects_on_first_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retryer = Retryer::spawn(
            config(counting_fn(5, Arc::clone(&calls)), RetryPolicy::Never),
            CancellationToken::new(),
        );
        retryer.start();
        let result = retryer.promise().await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_rejects_with_cancelled_error() {
        let fetch: AttemptFn = Arc::new(|| futures::future::pending().boxed());
        let signal = CancellationToken::new();
        let retryer = Retryer::spawn(config(fetch, RetryPolicy::Never), signal.clone());
        retryer.start();
        tokio::time::sleep(Duration::from_millis(5)).await;

        retryer.cancel(CancelOptions::revert());
        let result = retryer.promise().await;
        let error = result.expect_err("cancelled");
        let c = cancelled(&error).expect("cancelled error");
        assert!(c.revert);
        assert!(signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_cancelled_flag_rejects_on_next_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retryer = Retryer::spawn(
            config(counting_fn(10, Arc::clone(&calls)), RetryPolicy::Always),
            CancellationToken::new(),
        );
        retryer.cancel_retry();
        retryer.start();
        let result = retryer.promise().await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let delay = RetryDelay::default();
        let err = anyhow::anyhow!("x");
        assert_eq!(delay.delay(0, &err), Duration::from_secs(1));
        assert_eq!(delay.delay(1, &err), Duration::from_secs(2));
        assert_eq!(delay.delay(4, &err), Duration::from_secs(16));
        assert_eq!(delay.delay(10, &err), Duration::from_secs(30));
    }

    #[test]
    fn retry_policy_counts() {
        let err = anyhow::anyhow!("x");
        assert!(!RetryPolicy::Never.should_retry(0, &err));
        assert!(RetryPolicy::Count(2).should_retry(1, &err));
        assert!(!RetryPolicy::Count(2).should_retry(2, &err));
        assert!(RetryPolicy::default().should_retry(2, &err));
        assert!(!RetryPolicy::default().should_retry(3, &err));
        assert!(RetryPolicy::Always.should_retry(1000, &err));
    }
}
