//! Batch action implementations.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::features::sync::mutation::batch_cache_keys;
use crate::features::sync::{
    BatchMember, BatchOperation, BatchPayload, BatchResults, InvokeError, ItemTable, Mutation,
    NewItem, QueueItem, SyncEngine,
};

/// Result of a batch action on a single item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    /// The item ID.
    pub id: String,
    /// The table the item lives in.
    pub table: ItemTable,
    /// Whether the backend applied the action.
    pub success: bool,
    /// Error message if failed.
    pub error: Option<String>,
}

/// Summary of a batch action the backend processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// The action that was performed.
    pub operation: BatchOperation,
    /// Number of items sent.
    pub requested: usize,
    /// Number of items applied.
    pub succeeded: usize,
    /// Number of items rejected.
    pub failed: usize,
    /// Individual results.
    pub results: Vec<BatchResult>,
}

impl BatchSummary {
    fn new(operation: BatchOperation) -> Self {
        Self {
            operation,
            requested: 0,
            succeeded: 0,
            failed: 0,
            results: Vec::new(),
        }
    }

    fn from_results(operation: BatchOperation, results: BatchResults) -> Self {
        let mut summary = Self::new(operation);
        for member in results.succeeded {
            summary.add_success(member);
        }
        for failure in results.failed {
            summary.add_failure(failure.member, failure.error);
        }
        summary.requested = summary.succeeded + summary.failed;
        summary
    }

    fn add_success(&mut self, member: BatchMember) {
        self.succeeded += 1;
        self.results.push(BatchResult {
            id: member.id,
            table: member.table,
            success: true,
            error: None,
        });
    }

    fn add_failure(&mut self, member: BatchMember, error: String) {
        self.failed += 1;
        self.results.push(BatchResult {
            id: member.id,
            table: member.table,
            success: false,
            error: Some(error),
        });
    }

    /// Check if every item was applied.
    #[must_use]
    pub const fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// What became of a batch action.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// The backend processed it.
    Applied(BatchSummary),
    /// Deferred to the sync queue as one item.
    Queued(QueueItem),
    /// The backend refused it and retrying will not help.
    Rejected(InvokeError),
}

/// Entry point for batch actions.
#[derive(Clone)]
pub struct BatchActions {
    engine: SyncEngine,
}

impl BatchActions {
    /// Create batch actions over a sync engine.
    #[must_use]
    pub const fn new(engine: SyncEngine) -> Self {
        Self { engine }
    }

    /// Move items to the trash.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn delete(&self, items: Vec<BatchMember>) -> Result<BatchOutcome, SyncError> {
        self.run(BatchOperation::Delete, items).await
    }

    /// Bring items back from the trash.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn restore(&self, items: Vec<BatchMember>) -> Result<BatchOutcome, SyncError> {
        self.run(BatchOperation::Restore, items).await
    }

    /// Remove items for good.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn permanently_delete(
        &self,
        items: Vec<BatchMember>,
    ) -> Result<BatchOutcome, SyncError> {
        self.run(BatchOperation::PermanentDelete, items).await
    }

    /// Apply an operation to a set of items.
    ///
    /// When online the backend is called directly and only the items it
    /// applied have their caches invalidated. When offline, when a member
    /// still has undelivered mutations queued, or when the call fails in a
    /// retryable way, the whole action is queued as one item that keeps the
    /// idempotency key of the attempted call.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidState`] for an empty item list, or a
    /// storage error if queueing fails.
    pub async fn run(
        &self,
        operation: BatchOperation,
        items: Vec<BatchMember>,
    ) -> Result<BatchOutcome, SyncError> {
        let mut members: Vec<BatchMember> = Vec::with_capacity(items.len());
        for item in items {
            if !members.contains(&item) {
                members.push(item);
            }
        }
        if members.is_empty() {
            return Err(SyncError::InvalidState(
                "Batch action needs at least one item".to_string(),
            ));
        }

        let payload = BatchPayload {
            operation,
            items: members,
        };
        let pending = NewItem::new(Mutation::BatchAction(payload.clone()));

        if !self.engine.is_online() {
            info!(%operation, count = payload.items.len(), "Offline, queueing batch action");
            return self.queue(pending);
        }

        if self.engine.has_undelivered(&pending.mutation.entity_keys())? {
            info!(%operation, "Earlier mutations still queued, queueing batch action behind them");
            return self.queue(pending);
        }

        match self
            .engine
            .invoke_now(&pending.mutation, &pending.idempotency_key)
            .await
        {
            Ok(response) => {
                let results = payload.results(&response);
                self.engine
                    .invalidate(&batch_cache_keys(results.succeeded.iter()));
                Ok(BatchOutcome::Applied(BatchSummary::from_results(
                    operation, results,
                )))
            },
            Err(err) if err.kind.is_retryable() => {
                info!(%operation, error = %err, "Batch action deferred to sync queue");
                self.queue(pending)
            },
            Err(err) => {
                warn!(%operation, error = %err, "Batch action rejected");
                Ok(BatchOutcome::Rejected(err))
            },
        }
    }

    fn queue(&self, item: NewItem) -> Result<BatchOutcome, SyncError> {
        self.engine.enqueue_item(item).map(BatchOutcome::Queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::features::sync::mutation::AssignmentUpdate;
    use crate::features::sync::remote::{
        MockCacheInvalidator, MockRemoteInvoker, StaticSession,
    };
    use crate::features::sync::{
        Collaborators, ErrorKind, NetworkState, QueueStore, WatchMonitor,
    };
    use crate::storage::Database;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn member(id: &str) -> BatchMember {
        BatchMember {
            id: id.to_string(),
            table: ItemTable::Assignments,
        }
    }

    fn actions(
        invoker: MockRemoteInvoker,
        cache: MockCacheInvalidator,
        network: NetworkState,
    ) -> (BatchActions, SyncEngine) {
        let store = QueueStore::with_database(Database::open_in_memory().unwrap());
        let collaborators = Collaborators::new(
            Arc::new(invoker),
            Arc::new(StaticSession("token".to_string())),
        )
        .with_cache(Arc::new(cache))
        .with_network(Arc::new(WatchMonitor::new(network)));
        let engine = SyncEngine::open(store, collaborators, &Config::default()).unwrap();
        (BatchActions::new(engine.clone()), engine)
    }

    #[tokio::test]
    async fn test_offline_batch_is_queued_as_one_item() {
        let mut invoker = MockRemoteInvoker::new();
        invoker.expect_invoke().never();
        let mut cache = MockCacheInvalidator::new();
        cache.expect_invalidate().never();
        let (batch, engine) = actions(invoker, cache, NetworkState::offline());

        let outcome = batch.delete(vec![member("a"), member("b")]).await.unwrap();

        let BatchOutcome::Queued(item) = outcome else {
            panic!("expected queued outcome, got {outcome:?}");
        };
        assert_eq!(item.action_type(), "batch-action");
        let body = item.mutation.body().unwrap();
        assert_eq!(body["operation"], "delete");
        assert_eq!(body["items"][0]["id"], "a");
        assert_eq!(body["items"][1]["id"], "b");
        assert_eq!(engine.items().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_online_batch_reports_per_item_results() {
        let mut invoker = MockRemoteInvoker::new();
        invoker
            .expect_invoke()
            .withf(|req| req.action_name == "batch-action" && req.auth_token == "token")
            .times(1)
            .returning(|_| {
                Ok(json!({
                    "results": [
                        { "id": "a", "success": true },
                        { "id": "b", "success": false, "error": "not in trash" }
                    ]
                }))
            });
        let mut cache = MockCacheInvalidator::new();
        cache
            .expect_invalidate()
            .withf(|keys| {
                keys.contains(&"assignment:a".to_string())
                    && !keys.contains(&"assignment:b".to_string())
            })
            .times(1)
            .return_const(());
        let (batch, engine) = actions(invoker, cache, NetworkState::online());

        let outcome = batch
            .restore(vec![member("a"), member("b")])
            .await
            .unwrap();

        let BatchOutcome::Applied(summary) = outcome else {
            panic!("expected applied outcome, got {outcome:?}");
        };
        assert_eq!(summary.operation, BatchOperation::Restore);
        assert_eq!(summary.requested, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert!(!summary.all_succeeded());
        assert_eq!(summary.results[1].error.as_deref(), Some("not in trash"));
        assert!(engine.items().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connectivity_failure_falls_back_to_queue() {
        let sent_keys = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent_keys);
        let mut invoker = MockRemoteInvoker::new();
        invoker.expect_invoke().times(1).returning(move |req| {
            sink.lock().unwrap().push(req.idempotency_key.clone());
            Err(InvokeError::offline("connection reset"))
        });
        let (batch, _engine) = actions(invoker, MockCacheInvalidator::new(), NetworkState::online());

        let outcome = batch
            .permanently_delete(vec![member("a")])
            .await
            .unwrap();

        let BatchOutcome::Queued(item) = outcome else {
            panic!("expected queued outcome, got {outcome:?}");
        };
        assert_eq!(sent_keys.lock().unwrap()[0], item.idempotency_key);
    }

    #[tokio::test]
    async fn test_validation_failure_is_rejected_not_queued() {
        let mut invoker = MockRemoteInvoker::new();
        invoker
            .expect_invoke()
            .returning(|_| Err(InvokeError::from_status(400, "unknown table")));
        let (batch, engine) = actions(invoker, MockCacheInvalidator::new(), NetworkState::online());

        let outcome = batch.delete(vec![member("a")]).await.unwrap();

        assert!(matches!(
            outcome,
            BatchOutcome::Rejected(InvokeError { kind: ErrorKind::Validation, .. })
        ));
        assert!(engine.items().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_waits_behind_queued_edits_to_its_members() {
        let mut invoker = MockRemoteInvoker::new();
        invoker.expect_invoke().never();
        let (batch, engine) = actions(invoker, MockCacheInvalidator::new(), NetworkState::online());
        let edit = engine
            .enqueue(Mutation::UpdateAssignment(AssignmentUpdate {
                id: "a".to_string(),
                title: Some("Essay draft".to_string()),
                ..AssignmentUpdate::default()
            }))
            .unwrap();

        let outcome = batch.delete(vec![member("a"), member("b")]).await.unwrap();

        let BatchOutcome::Queued(item) = outcome else {
            panic!("expected queued outcome, got {outcome:?}");
        };
        let queued = engine.items().unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].id, edit.id);
        assert_eq!(queued[1].id, item.id);
    }

    #[tokio::test]
    async fn test_empty_and_duplicate_members() {
        let mut invoker = MockRemoteInvoker::new();
        invoker.expect_invoke().never();
        let (batch, engine) = actions(invoker, MockCacheInvalidator::new(), NetworkState::offline());

        let err = batch.delete(Vec::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));

        let outcome = batch
            .delete(vec![member("a"), member("a")])
            .await
            .unwrap();
        let BatchOutcome::Queued(item) = outcome else {
            panic!("expected queued outcome");
        };
        assert_eq!(item.mutation.entity_keys(), vec!["assignment:a"]);
        assert_eq!(engine.queue_stats().unwrap().pending, 1);
    }
}
