//! Drain counter.
//!
//! Counts outstanding units of work (in-flight connections and opted-in
//! routines). Shutdown completes when the counter reaches zero.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Concurrency-safe counter of outstanding work with an async "wait for zero".
///
/// Clones share the same count.
#[derive(Clone, Default)]
pub struct DrainCounter {
    inner: Arc<DrainInner>,
}

#[derive(Default)]
struct DrainInner {
    count: AtomicUsize,
    /// Notified when the count drops to zero.
    zero: Notify,
}

impl DrainCounter {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one unit of outstanding work.
    pub fn increase(&self) {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove one unit of outstanding work.
    ///
    /// # Panics
    ///
    /// Panics if the counter is already zero. Every decrease must be paired
    /// with an earlier increase; an underflow means connection tracking is broken.
    pub fn decrease(&self) {
        let prev = self
            .inner
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or_else(|_| panic!("drain counter decreased below zero, tracking bug"));
        if prev == 1 {
            self.inner.zero.notify_waiters();
        }
    }

    /// Current number of outstanding units.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Wait until the counter reaches zero. Returns immediately if it already is.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.zero.notified();
            tokio::pin!(notified);
            // Register before checking, otherwise a decrease between the
            // check and the await is missed.
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait for zero, giving up after `timeout`.
    ///
    /// Returns `true` if the counter drained, `false` if the timeout expired first.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Count a unit of work for as long as the returned guard lives.
    pub fn guard(&self) -> RoutineGuard {
        self.increase();
        RoutineGuard {
            counter: self.clone(),
        }
    }
}

impl std::fmt::Debug for DrainCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainCounter")
            .field("count", &self.count())
            .finish()
    }
}

/// Keeps one unit of work counted until dropped.
///
/// Handlers that spawn background work move a guard into the spawned task so
/// shutdown waits for that work too.
#[must_use = "the routine stops being counted as soon as the guard is dropped"]
#[derive(Debug)]
pub struct RoutineGuard {
    counter: DrainCounter,
}

impl Drop for RoutineGuard {
    fn drop(&mut self) {
        self.counter.decrease();
    }
}
