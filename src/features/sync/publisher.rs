//! Queue statistics fan-out.
//!
//! Subscribers see aggregate counts only, never items or payloads. Bursts of
//! changes are coalesced: inside a tokio runtime at most one flush is queued
//! at a time and it always publishes the latest snapshot.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};

use serde::Serialize;
use tracing::error;

use super::queue::StatusCounts;

/// Aggregate queue state exposed to UI collaborators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Items waiting for delivery, including the one in flight.
    pub pending: usize,
    /// Dead-lettered items awaiting user action.
    pub failed: usize,
    /// Delivered items still retained.
    pub completed: usize,
    /// Whether a drain is running.
    pub is_syncing: bool,
}

impl QueueStats {
    /// Build stats from store counts.
    #[must_use]
    pub const fn from_counts(counts: StatusCounts, is_syncing: bool) -> Self {
        Self {
            pending: counts.pending + counts.syncing,
            failed: counts.failed,
            completed: counts.completed,
            is_syncing,
        }
    }
}

type Callback = Arc<dyn Fn(&QueueStats) + Send + Sync>;

struct PublisherInner {
    subscribers: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
    latest: Mutex<Option<QueueStats>>,
    last_published: Mutex<Option<QueueStats>>,
    flush_scheduled: AtomicBool,
    flushing: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PublisherInner {
    /// Deliver recorded snapshots. Only one thread fans out at a time; a
    /// flush that finds another in progress leaves its snapshot to it.
    fn flush(&self) {
        self.flush_scheduled.store(false, Ordering::SeqCst);

        loop {
            let guard = match self.flushing.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };

            loop {
                let next = lock(&self.latest).take();
                let Some(stats) = next else {
                    break;
                };
                self.publish(stats);
            }

            drop(guard);

            // A snapshot recorded after the inner loop ended but before the
            // lock was released would otherwise be stranded
            if lock(&self.latest).is_none() {
                return;
            }
        }
    }

    fn publish(&self, stats: QueueStats) {
        {
            let mut last = lock(&self.last_published);
            if *last == Some(stats) {
                return;
            }
            *last = Some(stats);
        }

        // Snapshot so callbacks may subscribe or unsubscribe while running
        let callbacks: Vec<Callback> = lock(&self.subscribers)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&stats))).is_err() {
                error!(?stats, "queue stats subscriber panicked");
            }
        }
    }
}

/// Fan-out of [`QueueStats`] to registered callbacks.
#[derive(Clone)]
pub struct StatsPublisher {
    inner: Arc<PublisherInner>,
}

impl Default for StatsPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsPublisher {
    /// Create a publisher with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                latest: Mutex::new(None),
                last_published: Mutex::new(None),
                flush_scheduled: AtomicBool::new(false),
                flushing: Mutex::new(()),
            }),
        }
    }

    /// Register a callback for every stats change.
    ///
    /// The callback stays registered until the returned [`Subscription`] is
    /// dropped or unsubscribed.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&QueueStats) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers).push((id, Arc::new(callback)));
        Subscription {
            id,
            publisher: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    /// Record a new snapshot and schedule delivery.
    ///
    /// Outside a tokio runtime the snapshot is delivered immediately.
    pub fn notify(&self, stats: QueueStats) {
        *lock(&self.inner.latest) = Some(stats);

        if self.inner.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    inner.flush();
                });
            },
            Err(_) => self.inner.flush(),
        }
    }

    /// Deliver any recorded snapshot now.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// The snapshot most recently delivered to subscribers.
    #[must_use]
    pub fn last_published(&self) -> Option<QueueStats> {
        *lock(&self.inner.last_published)
    }
}

/// Handle for a registered stats callback. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    publisher: Weak<PublisherInner>,
}

impl Subscription {
    /// Stop receiving stats.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.publisher.upgrade() {
            lock(&inner.subscribers).retain(|(id, _)| *id != self.id);
        }
    }
}
