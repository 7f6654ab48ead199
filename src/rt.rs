//! Small runtime helpers shared across the engine.

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;

/// Spawns detached work onto the ambient tokio runtime.
///
/// Returns `None` when no runtime is available; callers that can degrade
/// (gc timers, notification flushes) fall back or skip in that case.
pub(crate) fn spawn<F>(fut: F) -> Option<JoinHandle<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::runtime::Handle::try_current()
        .ok()
        .map(|handle| handle.spawn(fut))
}

/// Wall-clock timestamp in epoch milliseconds.
///
/// State timestamps use wall-clock millis so dehydrated snapshots stay
/// meaningful across processes.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
