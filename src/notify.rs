//! # Batched listener notification.
//!
//! [`NotifyManager`] coalesces the many state updates a single public
//! operation can cause (cascading invalidations, bulk data writes) into one
//! flush, so adapters render once per transaction instead of once per
//! update.
//!
//! ## Architecture
//! ```text
//! batch(f)
//!   │  depth += 1
//!   ├─► f() ──► schedule(cb) ──► [queue]   (inside a transaction)
//!   │  depth -= 1 (drop guard, exception safe)
//!   └─► depth == 0 → flush:
//!         schedule_fn( || batch_notify_fn( || queue.for_each(notify_fn) ) )
//! ```
//!
//! ## Rules
//! - Nested `batch` calls are supported; only the outermost flush runs.
//! - `schedule` outside a transaction delivers through `schedule_fn`
//!   directly (one zero-delay task).
//! - All three hook functions are pluggable so adapters can wrap flushes in
//!   their own batching primitive (`set_batch_notify_function`).
//! - The default `schedule_fn` spawns a zero-delay tokio task and falls back
//!   to inline delivery when no runtime is present.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

/// A queued listener invocation.
pub type NotifyCallback = Box<dyn FnOnce() + Send>;

/// Hook signature shared by `notify_fn`, `batch_notify_fn`, `schedule_fn`.
pub type NotifyHook = Arc<dyn Fn(NotifyCallback) + Send + Sync>;

struct State {
    queue: Vec<NotifyCallback>,
    transactions: usize,
    notify_fn: NotifyHook,
    batch_notify_fn: NotifyHook,
    schedule_fn: NotifyHook,
}

/// Coalesces listener invocations across nested transactions.
pub struct NotifyManager {
    state: Mutex<State>,
}

static NOTIFY_MANAGER: OnceLock<NotifyManager> = OnceLock::new();

/// Process-wide notification batcher.
pub fn notify_manager() -> &'static NotifyManager {
    NOTIFY_MANAGER.get_or_init(NotifyManager::new)
}

impl NotifyManager {
    fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: Vec::new(),
                transactions: 0,
                notify_fn: Arc::new(|cb| cb()),
                batch_notify_fn: Arc::new(|cb| cb()),
                schedule_fn: Arc::new(|cb| {
                    // Zero-delay task keeps delivery out of the mutating
                    // call stack; without a runtime deliver inline so
                    // synchronous cache writes still notify.
                    match tokio::runtime::Handle::try_current() {
                        Ok(handle) => {
                            handle.spawn(async move { cb() });
                        }
                        Err(_) => cb(),
                    }
                }),
            }),
        }
    }

    /// Runs `f` inside a transaction and flushes queued callbacks when the
    /// outermost transaction ends. The depth is decremented even if `f`
    /// panics.
    pub fn batch<T>(&self, f: impl FnOnce() -> T) -> T {
        self.state.lock().transactions += 1;
        let _guard = BatchGuard { manager: self };
        f()
    }

    /// Queues `cb` when inside a transaction, otherwise delivers it through
    /// the schedule hook immediately.
    pub fn schedule(&self, cb: NotifyCallback) {
        let direct = {
            let mut state = self.state.lock();
            if state.transactions > 0 {
                state.queue.push(cb);
                None
            } else {
                Some((state.schedule_fn.clone(), state.notify_fn.clone(), cb))
            }
        };
        if let Some((schedule_fn, notify_fn, cb)) = direct {
            schedule_fn(Box::new(move || notify_fn(cb)));
        }
    }

    /// Wraps `f` so every invocation is routed through [`Self::schedule`].
    pub fn batch_calls<A: Send + 'static>(
        &'static self,
        f: Arc<dyn Fn(A) + Send + Sync>,
    ) -> impl Fn(A) + Send + Sync + 'static {
        move |arg| {
            let f = Arc::clone(&f);
            self.schedule(Box::new(move || f(arg)));
        }
    }

    /// Replaces the per-callback delivery hook.
    pub fn set_notify_function(&self, f: NotifyHook) {
        self.state.lock().notify_fn = f;
    }

    /// Replaces the hook wrapping one whole flush. Adapters install their
    /// framework's update coalescer here.
    pub fn set_batch_notify_function(&self, f: NotifyHook) {
        self.state.lock().batch_notify_fn = f;
    }

    /// Replaces the flush scheduling hook.
    pub fn set_schedule_function(&self, f: NotifyHook) {
        self.state.lock().schedule_fn = f;
    }

    fn flush(&self) {
        let flushable = {
            let mut state = self.state.lock();
            if state.transactions != 0 || state.queue.is_empty() {
                None
            } else {
                let queue = std::mem::take(&mut state.queue);
                Some((
                    queue,
                    state.schedule_fn.clone(),
                    state.batch_notify_fn.clone(),
                    state.notify_fn.clone(),
                ))
            }
        };
        if let Some((queue, schedule_fn, batch_notify_fn, notify_fn)) = flushable {
            schedule_fn(Box::new(move || {
                batch_notify_fn(Box::new(move || {
                    for cb in queue {
                        notify_fn(cb);
                    }
                }));
            }));
        }
    }
}

struct BatchGuard<'a> {
    manager: &'a NotifyManager,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.manager.state.lock().transactions -= 1;
        self.manager.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager() -> NotifyManager {
        NotifyManager::new()
    }

    #[tokio::test]
    async fn batch_flushes_queued_callbacks_once() {
        let m = manager();
        let count = Arc::new(AtomicUsize::new(0));

        m.batch(|| {
            for _ in 0..3 {
                let c = Arc::clone(&count);
                m.schedule(Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }));
            }
            // Nothing delivered while the transaction is open.
            assert_eq!(count.load(Ordering::SeqCst), 0);
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn nested_batches_flush_at_depth_zero() {
        let m = manager();
        let count = Arc::new(AtomicUsize::new(0));

        m.batch(|| {
            m.batch(|| {
                let c = Arc::clone(&count);
                m.schedule(Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }));
            });
            // Inner batch ended but the outer one is still open.
            assert_eq!(count.load(Ordering::SeqCst), 0);
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn schedule_outside_transaction_delivers() {
        let m = manager();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        m.schedule(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_batch_still_flushes() {
        let m = Arc::new(manager());
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let m2 = Arc::clone(&m);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            m2.batch(|| {
                let c = Arc::clone(&c);
                m2.schedule(Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }));
                panic!("boom");
            });
        }));
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Depth returned to zero: a later schedule delivers directly.
        let c = Arc::clone(&count);
        m.schedule(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
