//! Sync engine for delivering queued mutations.
//!
//! Drains the queue in order with per-class retry, connectivity awareness and
//! cache invalidation. The engine is a cheap handle; clones share one queue.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::mutation::{ItemError, ItemId, ItemStatus, Mutation, NewItem, QueueItem};
use super::network::{NetworkMonitor, NetworkState, WatchMonitor};
use super::publisher::{QueueStats, StatsPublisher, Subscription};
use super::queue::{ItemPatch, PruneReport, QueueStore};
use super::remote::{
    CacheInvalidator, ErrorKind, InvokeError, InvokeRequest, NoopCache, RemoteInvoker,
    SessionProvider,
};
use super::retry::RetryPolicy;
use crate::config::{Config, RetryConfig};
use crate::error::SyncError;

/// External services the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub invoker: Arc<dyn RemoteInvoker>,
    pub session: Arc<dyn SessionProvider>,
    pub cache: Arc<dyn CacheInvalidator>,
    pub network: Arc<dyn NetworkMonitor>,
}

impl Collaborators {
    /// Collaborators with no cache and an always-online network.
    #[must_use]
    pub fn new(invoker: Arc<dyn RemoteInvoker>, session: Arc<dyn SessionProvider>) -> Self {
        Self {
            invoker,
            session,
            cache: Arc::new(NoopCache),
            network: Arc::new(WatchMonitor::default()),
        }
    }

    /// Use a query cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheInvalidator>) -> Self {
        self.cache = cache;
        self
    }

    /// Use a network monitor.
    #[must_use]
    pub fn with_network(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = network;
        self
    }
}

/// What happened to one item during a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Delivered.
    Completed,
    /// Dead-lettered.
    Failed,
    /// Rolled back to pending for a later retry.
    Deferred,
    /// Not attempted because an earlier item for the same entity was deferred.
    Blocked,
}

/// Result of processing a single item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryResult {
    pub id: ItemId,
    pub action_type: &'static str,
    pub outcome: ItemOutcome,
    pub error: Option<ItemError>,
}

impl DeliveryResult {
    fn new(item: &QueueItem, outcome: ItemOutcome, error: Option<ItemError>) -> Self {
        Self {
            id: item.id,
            action_type: item.action_type(),
            outcome,
            error,
        }
    }
}

/// Result of one drain.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    /// False when the drain was skipped, e.g. another drain was running.
    pub ran: bool,
    pub succeeded: usize,
    pub failed: usize,
    pub deferred: usize,
    pub blocked: usize,
    /// Individual results in processing order.
    pub results: Vec<DeliveryResult>,
}

impl DrainReport {
    fn started() -> Self {
        Self {
            ran: true,
            ..Self::default()
        }
    }

    /// Add a result.
    pub fn add(&mut self, result: DeliveryResult) {
        match result.outcome {
            ItemOutcome::Completed => self.succeeded += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Deferred => self.deferred += 1,
            ItemOutcome::Blocked => self.blocked += 1,
        }
        self.results.push(result);
    }

    /// Check if every processed item was delivered.
    #[must_use]
    pub const fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.deferred == 0 && self.blocked == 0
    }

    /// Get total items processed.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.succeeded + self.failed + self.deferred + self.blocked
    }
}

/// Outcome of one delivery attempt as seen by the drain loop.
struct Delivery {
    result: DeliveryResult,
    connectivity_lost: bool,
    retry_in: Option<Duration>,
}

impl Delivery {
    const fn settled(result: DeliveryResult) -> Self {
        Self {
            result,
            connectivity_lost: false,
            retry_in: None,
        }
    }
}

struct ScheduledRetry {
    due: Instant,
    generation: u64,
    handle: JoinHandle<()>,
}

struct EngineInner {
    store: Mutex<QueueStore>,
    invoker: Arc<dyn RemoteInvoker>,
    session: Arc<dyn SessionProvider>,
    cache: Arc<dyn CacheInvalidator>,
    network: watch::Receiver<NetworkState>,
    publisher: StatsPublisher,
    retry: RetryConfig,
    request_timeout: Duration,
    draining: AtomicBool,
    retry_timer: Mutex<Option<ScheduledRetry>>,
    timer_generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the drain flag when a drain ends, even if its future is dropped.
///
/// An item still marked in flight at that point goes back to pending.
struct DrainGuard<'a> {
    inner: &'a EngineInner,
    in_flight: Option<ItemId>,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.in_flight.take() {
            let rollback =
                lock(&self.inner.store).update(id, &ItemPatch::status(ItemStatus::Pending));
            if let Err(e) = rollback {
                warn!(item_id = id, error = %e, "Failed to roll back interrupted item");
            }
        }
        self.inner.draining.store(false, Ordering::SeqCst);
    }
}

/// Handle to the offline mutation queue.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Open the engine over a store.
    ///
    /// Items left `syncing` by a previous process are returned to pending
    /// before anything else happens.
    ///
    /// # Errors
    ///
    /// Returns an error if recovery fails.
    pub fn open(
        store: QueueStore,
        collaborators: Collaborators,
        config: &Config,
    ) -> Result<Self, SyncError> {
        let recovered = store.recover_in_flight()?;
        if recovered > 0 {
            info!(recovered, "Recovered in-flight items from previous session");
        }

        let Collaborators {
            invoker,
            session,
            cache,
            network,
        } = collaborators;

        Ok(Self {
            inner: Arc::new(EngineInner {
                store: Mutex::new(store),
                invoker,
                session,
                cache,
                network: network.watch(),
                publisher: StatsPublisher::new(),
                retry: config.retry,
                request_timeout: config.network.request_timeout(),
                draining: AtomicBool::new(false),
                retry_timer: Mutex::new(None),
                timer_generation: AtomicU64::new(0),
            }),
        })
    }

    fn store(&self) -> MutexGuard<'_, QueueStore> {
        lock(&self.inner.store)
    }

    /// Persist a mutation for later delivery.
    ///
    /// The item is durable once this returns. Nothing is sent until the next
    /// drain.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::QueueFull`] when no room can be made, or a
    /// storage error.
    pub fn enqueue(&self, mutation: Mutation) -> Result<QueueItem, SyncError> {
        self.enqueue_item(NewItem::new(mutation))
    }

    /// Persist a mutation that later items depend on.
    ///
    /// If it is deferred, nothing queued after it is attempted in the same
    /// drain.
    ///
    /// # Errors
    ///
    /// Same as [`enqueue`](Self::enqueue).
    pub fn enqueue_prerequisite(&self, mutation: Mutation) -> Result<QueueItem, SyncError> {
        self.enqueue_item(NewItem::new(mutation).as_prerequisite())
    }

    /// Persist a prepared item.
    ///
    /// # Errors
    ///
    /// Same as [`enqueue`](Self::enqueue).
    pub fn enqueue_item(&self, item: NewItem) -> Result<QueueItem, SyncError> {
        let queued = self.store().append(item)?;
        info!(
            item_id = queued.id,
            action = queued.action_type(),
            "Queued mutation for sync"
        );
        self.publish_stats();
        Ok(queued)
    }

    /// Deliver pending items in order.
    ///
    /// Only one drain runs at a time; a call made while one is running
    /// returns immediately with `ran == false`. Items enqueued during the
    /// drain are picked up before it finishes.
    pub async fn drain(&self) -> DrainReport {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Drain already in progress");
            return DrainReport::default();
        }

        let mut guard = DrainGuard {
            inner: &self.inner,
            in_flight: None,
        };
        self.publish_stats();

        let (report, retry_in) = self.run_drain(&mut guard).await;

        drop(guard);
        self.publish_stats();

        // A timer that fired while this drain ran found it busy and was
        // spent, so deferred items need a fresh one
        if let Some(delay) = retry_in {
            if self.is_online() && !self.retry_scheduled() {
                debug!(?delay, "Re-arming retry timer after drain");
                self.schedule_retry(delay);
            }
        }

        if report.total() > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                deferred = report.deferred,
                blocked = report.blocked,
                "Sync drain finished"
            );
        }
        report
    }

    /// Returns the report and the shortest retry delay of any deferred item.
    async fn run_drain(&self, guard: &mut DrainGuard<'_>) -> (DrainReport, Option<Duration>) {
        let Some(token) = self.inner.session.access_token() else {
            warn!("No auth session, leaving queued mutations pending");
            return (DrainReport::default(), None);
        };

        let mut report = DrainReport::started();
        let mut retry_in: Option<Duration> = None;
        let mut attempted: HashSet<ItemId> = HashSet::new();
        let mut blocked: HashSet<String> = HashSet::new();

        'session: loop {
            let listed = self.store().list_pending();
            let pending = match listed {
                Ok(items) => items,
                Err(e) => {
                    error!(error = %e, "Failed to list pending items");
                    break;
                },
            };

            let fresh: Vec<QueueItem> = pending
                .into_iter()
                .filter(|item| !attempted.contains(&item.id))
                .collect();
            if fresh.is_empty() {
                break;
            }

            for item in fresh {
                attempted.insert(item.id);
                let keys = item.mutation.entity_keys();

                if keys.iter().any(|key| blocked.contains(key)) {
                    debug!(item_id = item.id, "Blocked behind deferred item");
                    blocked.extend(keys);
                    report.add(DeliveryResult::new(&item, ItemOutcome::Blocked, None));
                    continue;
                }

                let Some(delivery) = self.deliver(&item, &token, guard).await else {
                    break 'session;
                };

                let deferred = delivery.result.outcome == ItemOutcome::Deferred;
                report.add(delivery.result);
                if let Some(delay) = delivery.retry_in {
                    retry_in = Some(retry_in.map_or(delay, |current| current.min(delay)));
                }

                if deferred {
                    blocked.extend(keys);
                    if delivery.connectivity_lost {
                        info!("Connectivity lost, stopping drain");
                        break 'session;
                    }
                    if item.prerequisite {
                        info!(item_id = item.id, "Prerequisite deferred, stopping drain");
                        break 'session;
                    }
                }
            }
        }

        (report, retry_in)
    }

    /// Attempt one item. `None` means storage failed and the drain should
    /// stop.
    async fn deliver(
        &self,
        item: &QueueItem,
        token: &str,
        guard: &mut DrainGuard<'_>,
    ) -> Option<Delivery> {
        let marked = self
            .store()
            .update(item.id, &ItemPatch::status(ItemStatus::Syncing));
        if let Err(e) = marked {
            error!(item_id = item.id, error = %e, "Failed to mark item syncing");
            return None;
        }
        guard.in_flight = Some(item.id);
        self.publish_stats();

        let response = match item.mutation.body() {
            Ok(body) => {
                let request = InvokeRequest {
                    action_name: item.action_type().to_string(),
                    body,
                    idempotency_key: item.idempotency_key.clone(),
                    auth_token: token.to_string(),
                };
                self.invoke_with_timeout(&request).await
            },
            Err(e) => Err(InvokeError::new(ErrorKind::Validation, e.to_string())),
        };

        let attempted_at = Utc::now();
        let recorded = match response {
            Ok(data) => self
                .record_success(item, &data, attempted_at)
                .map(Delivery::settled),
            Err(err) => self.record_failure(item, &err, attempted_at),
        };

        match recorded {
            Ok(delivery) => {
                guard.in_flight = None;
                self.publish_stats();
                Some(delivery)
            },
            Err(e) => {
                error!(item_id = item.id, error = %e, "Failed to record delivery outcome");
                None
            },
        }
    }

    async fn invoke_with_timeout(&self, request: &InvokeRequest) -> Result<Value, InvokeError> {
        let timeout = self.inner.request_timeout;
        match tokio::time::timeout(timeout, self.inner.invoker.invoke(request)).await {
            Ok(result) => result,
            Err(_) => Err(InvokeError::timeout(timeout)),
        }
    }

    fn record_success(
        &self,
        item: &QueueItem,
        response: &Value,
        at: DateTime<Utc>,
    ) -> Result<DeliveryResult, SyncError> {
        self.store().update(
            item.id,
            &ItemPatch::status(ItemStatus::Completed)
                .with_attempts(item.attempts + 1)
                .attempted_at(at)
                .with_error(None),
        )?;

        let keys = item.mutation.invalidation_keys(response);
        if !keys.is_empty() {
            self.inner.cache.invalidate(&keys);
        }

        debug!(item_id = item.id, action = item.action_type(), "Delivered queued mutation");
        Ok(DeliveryResult::new(item, ItemOutcome::Completed, None))
    }

    fn record_failure(
        &self,
        item: &QueueItem,
        err: &InvokeError,
        at: DateTime<Utc>,
    ) -> Result<Delivery, SyncError> {
        let monitor_online = self.is_online();
        let connectivity_lost =
            err.kind.is_retryable() && (err.kind == ErrorKind::Offline || !monitor_online);
        let policy = RetryPolicy::for_class(item.mutation.class(), &self.inner.retry);
        let error = ItemError {
            kind: err.kind,
            message: err.message.clone(),
        };

        let attempts = item.attempts + 1;

        if policy.is_terminal(item.attempts, err.kind) {
            self.store().update(
                item.id,
                &ItemPatch::status(ItemStatus::Failed)
                    .with_attempts(attempts)
                    .attempted_at(at)
                    .with_error(Some(error.clone())),
            )?;
            if err.kind == ErrorKind::Auth {
                warn!(item_id = item.id, "Mutation rejected, re-authentication required");
            } else {
                warn!(
                    item_id = item.id,
                    action = item.action_type(),
                    attempts,
                    error = %err,
                    "Mutation failed permanently"
                );
            }
            return Ok(Delivery::settled(DeliveryResult::new(
                item,
                ItemOutcome::Failed,
                Some(error),
            )));
        }

        self.store().update(
            item.id,
            &ItemPatch::status(ItemStatus::Pending)
                .with_attempts(attempts)
                .attempted_at(at)
                .with_error(Some(error.clone())),
        )?;

        let mut delay = policy.next_delay(item.attempts);
        if let Some(hint) = err.retry_after {
            delay = delay.max(hint);
        }
        debug!(
            item_id = item.id,
            attempts,
            ?delay,
            error = %err,
            "Delivery deferred"
        );

        // The reconnect drain covers this case
        if monitor_online {
            self.schedule_retry(delay);
        }

        Ok(Delivery {
            result: DeliveryResult::new(item, ItemOutcome::Deferred, Some(error)),
            connectivity_lost,
            retry_in: Some(delay),
        })
    }

    /// Arm the retry timer. An earlier pending timer wins over a later one.
    fn schedule_retry(&self, delay: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, retry not scheduled");
            return;
        };

        let due = Instant::now() + delay;
        let mut slot = lock(&self.inner.retry_timer);

        if let Some(existing) = slot.as_ref() {
            if existing.due <= due && !existing.handle.is_finished() {
                return;
            }
            existing.handle.abort();
        }

        let generation = self.inner.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(due).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut slot = lock(&inner.retry_timer);
                match slot.as_ref() {
                    Some(timer) if timer.generation == generation => *slot = None,
                    _ => return,
                }
            }
            let report = Self { inner }.drain().await;
            debug!(?report, "Retry drain finished");
        });

        *slot = Some(ScheduledRetry {
            due,
            generation,
            handle,
        });
    }

    /// Whether a retry timer is armed.
    #[must_use]
    pub fn retry_scheduled(&self) -> bool {
        lock(&self.inner.retry_timer)
            .as_ref()
            .is_some_and(|timer| !timer.handle.is_finished())
    }

    /// Send a mutation right away, outside the queue.
    ///
    /// Uses the same auth, timeout and idempotency handling as a drain.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::Auth`] error when signed out, or whatever the
    /// remote call fails with.
    pub async fn invoke_now(
        &self,
        mutation: &Mutation,
        idempotency_key: &str,
    ) -> Result<Value, InvokeError> {
        let Some(token) = self.inner.session.access_token() else {
            return Err(InvokeError::new(ErrorKind::Auth, "Not signed in"));
        };
        let body = mutation
            .body()
            .map_err(|e| InvokeError::new(ErrorKind::Validation, e.to_string()))?;
        let request = InvokeRequest {
            action_name: mutation.action_name().to_string(),
            body,
            idempotency_key: idempotency_key.to_string(),
            auth_token: token,
        };
        self.invoke_with_timeout(&request).await
    }

    /// Drop cached query results.
    pub fn invalidate(&self, query_keys: &[String]) {
        if !query_keys.is_empty() {
            self.inner.cache.invalidate(query_keys);
        }
    }

    /// Whether the network monitor reports the device online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.network.borrow().is_online()
    }

    /// Whether a drain is running.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Current aggregate counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn queue_stats(&self) -> Result<QueueStats, SyncError> {
        let counts = self.store().counts()?;
        Ok(QueueStats::from_counts(counts, self.is_syncing()))
    }

    /// Register a callback for stats changes.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&QueueStats) + Send + Sync + 'static,
    {
        self.inner.publisher.subscribe(callback)
    }

    fn publish_stats(&self) {
        match self.queue_stats() {
            Ok(stats) => self.inner.publisher.notify(stats),
            Err(e) => error!(error = %e, "Failed to read queue stats"),
        }
    }

    /// All stored items in delivery order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn items(&self) -> Result<Vec<QueueItem>, SyncError> {
        self.store().all()
    }

    /// Stored items with one status.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn items_with_status(&self, status: ItemStatus) -> Result<Vec<QueueItem>, SyncError> {
        self.store().by_status(status)
    }

    /// Whether an undelivered item touches any of `entity_keys`.
    ///
    /// Direct calls on those entities must go through the queue instead, or
    /// they would overtake the earlier mutations.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn has_undelivered(&self, entity_keys: &[String]) -> Result<bool, SyncError> {
        let store = self.store();
        let mut undelivered = store.list_pending()?;
        undelivered.extend(store.by_status(ItemStatus::Syncing)?);
        drop(store);

        Ok(undelivered.iter().any(|item| {
            item.mutation
                .entity_keys()
                .iter()
                .any(|key| entity_keys.contains(key))
        }))
    }

    /// Withdraw a pending item before it is sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the item is missing or no longer pending.
    pub fn cancel(&self, id: ItemId) -> Result<QueueItem, SyncError> {
        let cancelled = self.store().cancel_pending(id)?;
        info!(item_id = id, action = cancelled.action_type(), "Cancelled queued mutation");
        self.publish_stats();
        Ok(cancelled)
    }

    /// Give a failed item another round of attempts.
    ///
    /// It is re-appended with the same idempotency key and a reset attempt
    /// count; the failed entry is removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the item is missing or has not failed.
    pub fn retry_failed(&self, id: ItemId) -> Result<QueueItem, SyncError> {
        let requeued = self.store().requeue_failed(id)?;
        info!(from = id, to = requeued.id, "Requeued failed mutation");
        self.publish_stats();
        Ok(requeued)
    }

    /// Requeue every failed item.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or updated.
    pub fn retry_all_failed(&self) -> Result<Vec<QueueItem>, SyncError> {
        let requeued = self.store().requeue_all_failed()?;
        if !requeued.is_empty() {
            info!(count = requeued.len(), "Requeued failed mutations");
            self.publish_stats();
        }
        Ok(requeued)
    }

    /// Discard a failed item.
    ///
    /// # Errors
    ///
    /// Returns an error if the item is missing or has not failed.
    pub fn dismiss_failed(&self, id: ItemId) -> Result<QueueItem, SyncError> {
        let item = self.store().dismiss_failed(id)?;
        info!(item_id = id, action = item.action_type(), "Dismissed failed mutation");
        self.publish_stats();
        Ok(item)
    }

    /// Apply retention: drop old completed and failed items.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be updated.
    pub fn prune(&self) -> Result<PruneReport, SyncError> {
        let report = self.store().prune_expired(Utc::now())?;
        if report.total() > 0 {
            info!(
                completed = report.completed,
                failed = report.failed,
                "Pruned sync queue"
            );
            self.publish_stats();
        }
        Ok(report)
    }
}
