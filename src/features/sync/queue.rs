//! Persistent queue store.
//!
//! Every queued mutation is a row in `sync_queue`. Appends are committed
//! before they return, so an item survives a crash at any later point.
//! Pending items are listed by `created_at`, ties broken by insertion id.

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, warn};

use super::mutation::{ItemError, ItemId, ItemStatus, Mutation, NewItem, QueueItem};
use super::remote::ErrorKind;
use crate::config::QueueConfig;
use crate::error::SyncError;
use crate::storage::Database;

const SELECT_COLUMNS: &str = "SELECT id, action_type, payload, idempotency_key, created_at, \
     attempts, last_attempt, last_error_kind, last_error, status, prerequisite FROM sync_queue";

/// Partial update applied by [`QueueStore::update`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemPatch {
    pub status: Option<ItemStatus>,
    pub attempts: Option<u32>,
    pub last_attempt: Option<DateTime<Utc>>,
    /// `Some(None)` clears the recorded error.
    pub last_error: Option<Option<ItemError>>,
}

impl ItemPatch {
    /// Patch that only changes status.
    #[must_use]
    pub fn status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Also set the attempt counter.
    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Also stamp the attempt time.
    #[must_use]
    pub const fn attempted_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_attempt = Some(at);
        self
    }

    /// Also record (or clear, with `None`) the last error.
    #[must_use]
    pub fn with_error(mut self, error: Option<ItemError>) -> Self {
        self.last_error = Some(error);
        self
    }
}

/// Item counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub syncing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    /// Total number of stored items.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.pending + self.syncing + self.completed + self.failed
    }
}

/// Items removed by a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub completed: usize,
    pub failed: usize,
}

impl PruneReport {
    /// Total items removed.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.completed + self.failed
    }
}

/// Durable, ordered store of queued mutations.
pub struct QueueStore {
    db: Database,
    capacity: usize,
    dead_letter_limit: usize,
    completed_retention: Duration,
    failed_retention: Duration,
}

impl QueueStore {
    /// Create a store over an open database.
    #[must_use]
    pub fn new(db: Database, config: &QueueConfig) -> Self {
        Self {
            db,
            capacity: config.capacity,
            dead_letter_limit: config.dead_letter_limit,
            completed_retention: Duration::hours(i64::from(config.completed_retention_hours)),
            failed_retention: Duration::days(i64::from(config.dead_letter_retention_days)),
        }
    }

    /// Create a store with default bounds.
    #[must_use]
    pub fn with_database(db: Database) -> Self {
        Self::new(db, &QueueConfig::default())
    }

    /// Maximum number of items this store holds.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an item.
    ///
    /// When the store is at capacity the oldest completed items are evicted
    /// first; pending, syncing and failed items are never evicted.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::QueueFull`] if no room can be made, or a database
    /// error if the insert fails.
    pub fn append(&self, item: NewItem) -> Result<QueueItem, SyncError> {
        let counts = self.counts()?;

        if counts.failed >= self.dead_letter_limit {
            warn!(
                failed = counts.failed,
                limit = self.dead_letter_limit,
                "dead-letter limit reached, rejecting enqueue"
            );
            return Err(SyncError::QueueFull {
                capacity: self.capacity,
            });
        }

        if counts.total() >= self.capacity {
            let overflow = counts.total() + 1 - self.capacity;
            let evicted = self.evict_completed(overflow)?;
            if evicted < overflow {
                return Err(SyncError::QueueFull {
                    capacity: self.capacity,
                });
            }
        }

        insert_item(self.db.connection(), item)
    }

    /// Pending items in delivery order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_pending(&self) -> Result<Vec<QueueItem>, SyncError> {
        self.query(
            &format!("{SELECT_COLUMNS} WHERE status = 'pending' ORDER BY created_at ASC, id ASC"),
            &[],
        )
    }

    /// Every stored item in delivery order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn all(&self) -> Result<Vec<QueueItem>, SyncError> {
        self.query(&format!("{SELECT_COLUMNS} ORDER BY created_at ASC, id ASC"), &[])
    }

    /// Items with a given status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn by_status(&self, status: ItemStatus) -> Result<Vec<QueueItem>, SyncError> {
        self.query(
            &format!("{SELECT_COLUMNS} WHERE status = ?1 ORDER BY created_at ASC, id ASC"),
            &[&status.as_str()],
        )
    }

    /// Get a specific item by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, id: ItemId) -> Result<Option<QueueItem>, SyncError> {
        let conn = self.db.connection();

        let raw = conn
            .query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), [id], RawItem::from_row)
            .optional()
            .map_err(|e| SyncError::Database(format!("Failed to query item: {e}")))?;

        raw.map(RawItem::into_item).transpose()
    }

    /// Apply a patch to an item and return the updated item.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] if the item does not exist and
    /// [`SyncError::InvalidState`] if the status change is not allowed.
    pub fn update(&self, id: ItemId, patch: &ItemPatch) -> Result<QueueItem, SyncError> {
        let mut item = self
            .get(id)?
            .ok_or_else(|| SyncError::NotFound(format!("Queue item {id}")))?;

        if let Some(next) = patch.status {
            if !item.status.can_transition_to(next) {
                return Err(SyncError::InvalidState(format!(
                    "Queue item {id} cannot move from {} to {next}",
                    item.status
                )));
            }
            item.status = next;
        }
        if let Some(attempts) = patch.attempts {
            item.attempts = attempts;
        }
        if let Some(at) = patch.last_attempt {
            item.last_attempt = Some(at);
        }
        if let Some(error) = &patch.last_error {
            item.last_error.clone_from(error);
        }

        self.db
            .connection()
            .execute(
                r"UPDATE sync_queue SET
                  attempts = ?1,
                  last_attempt = ?2,
                  last_error_kind = ?3,
                  last_error = ?4,
                  status = ?5
                  WHERE id = ?6",
                params![
                    item.attempts,
                    item.last_attempt.map(encode_time),
                    item.last_error.as_ref().map(|e| e.kind.as_str()),
                    item.last_error.as_ref().map(|e| e.message.as_str()),
                    item.status.as_str(),
                    id,
                ],
            )
            .map_err(|e| SyncError::Database(format!("Failed to update item: {e}")))?;

        Ok(item)
    }

    /// Delete an item. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn remove(&self, id: ItemId) -> Result<bool, SyncError> {
        let rows = self
            .db
            .connection()
            .execute("DELETE FROM sync_queue WHERE id = ?1", [id])
            .map_err(|e| SyncError::Database(format!("Failed to remove item: {e}")))?;

        Ok(rows > 0)
    }

    /// Withdraw an item that has not started syncing.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] if the item does not exist and
    /// [`SyncError::InvalidState`] if it is not pending.
    pub fn cancel_pending(&self, id: ItemId) -> Result<QueueItem, SyncError> {
        let item = self
            .get(id)?
            .ok_or_else(|| SyncError::NotFound(format!("Queue item {id}")))?;

        if item.status != ItemStatus::Pending {
            return Err(SyncError::InvalidState(format!(
                "Queue item {id} is {} and can no longer be cancelled",
                item.status
            )));
        }

        let rows = self
            .db
            .connection()
            .execute(
                "DELETE FROM sync_queue WHERE id = ?1 AND status = 'pending'",
                [id],
            )
            .map_err(|e| SyncError::Database(format!("Failed to cancel item: {e}")))?;

        if rows == 0 {
            return Err(SyncError::InvalidState(format!(
                "Queue item {id} changed state before it could be cancelled"
            )));
        }

        Ok(item)
    }

    /// Move a failed item back to the end of the queue.
    ///
    /// The failed row is replaced by a fresh pending row carrying the same
    /// mutation and idempotency key, in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] if the item does not exist and
    /// [`SyncError::InvalidState`] if it has not failed.
    pub fn requeue_failed(&self, id: ItemId) -> Result<QueueItem, SyncError> {
        let item = self
            .get(id)?
            .ok_or_else(|| SyncError::NotFound(format!("Queue item {id}")))?;

        if item.status != ItemStatus::Failed {
            return Err(SyncError::InvalidState(format!(
                "Queue item {id} is {}, only failed items can be retried",
                item.status
            )));
        }

        let tx = self
            .db
            .connection()
            .unchecked_transaction()
            .map_err(|e| SyncError::Database(format!("Failed to begin transaction: {e}")))?;

        tx.execute("DELETE FROM sync_queue WHERE id = ?1", [id])
            .map_err(|e| SyncError::Database(format!("Failed to remove item: {e}")))?;

        let requeued = insert_item(
            &tx,
            NewItem {
                mutation: item.mutation,
                idempotency_key: item.idempotency_key,
                created_at: Utc::now(),
                prerequisite: item.prerequisite,
            },
        )?;

        tx.commit()
            .map_err(|e| SyncError::Database(format!("Failed to requeue item: {e}")))?;

        debug!(from = id, to = requeued.id, "requeued failed item");
        Ok(requeued)
    }

    /// Requeue every failed item, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or updated.
    pub fn requeue_all_failed(&self) -> Result<Vec<QueueItem>, SyncError> {
        self.by_status(ItemStatus::Failed)?
            .into_iter()
            .map(|item| self.requeue_failed(item.id))
            .collect()
    }

    /// Discard a failed item.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] if the item does not exist and
    /// [`SyncError::InvalidState`] if it has not failed.
    pub fn dismiss_failed(&self, id: ItemId) -> Result<QueueItem, SyncError> {
        let item = self
            .get(id)?
            .ok_or_else(|| SyncError::NotFound(format!("Queue item {id}")))?;

        if item.status != ItemStatus::Failed {
            return Err(SyncError::InvalidState(format!(
                "Queue item {id} is {}, only failed items can be dismissed",
                item.status
            )));
        }

        self.remove(id)?;
        Ok(item)
    }

    /// Drop completed and failed items past their retention age.
    ///
    /// # Errors
    ///
    /// Returns an error if a delete fails.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> Result<PruneReport, SyncError> {
        Ok(PruneReport {
            completed: self.prune_completed(now - self.completed_retention)?,
            failed: self.prune_failed(now - self.failed_retention)?,
        })
    }

    /// Return items left `syncing` by a previous process to `pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn recover_in_flight(&self) -> Result<usize, SyncError> {
        self.db
            .connection()
            .execute(
                "UPDATE sync_queue SET status = 'pending' WHERE status = 'syncing'",
                [],
            )
            .map_err(|e| SyncError::Database(format!("Failed to recover in-flight items: {e}")))
    }

    /// Delete up to `count` of the oldest completed items.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn evict_completed(&self, count: usize) -> Result<usize, SyncError> {
        let limit = i64::try_from(count).unwrap_or(i64::MAX);
        let rows = self
            .db
            .connection()
            .execute(
                r"DELETE FROM sync_queue WHERE id IN (
                    SELECT id FROM sync_queue WHERE status = 'completed'
                    ORDER BY created_at ASC, id ASC LIMIT ?1
                  )",
                [limit],
            )
            .map_err(|e| SyncError::Database(format!("Failed to evict completed items: {e}")))?;

        if rows > 0 {
            debug!(evicted = rows, "evicted completed items to make room");
        }
        Ok(rows)
    }

    /// Delete completed items created before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn prune_completed(&self, cutoff: DateTime<Utc>) -> Result<usize, SyncError> {
        self.db
            .connection()
            .execute(
                "DELETE FROM sync_queue WHERE status = 'completed' AND created_at < ?1",
                [encode_time(cutoff)],
            )
            .map_err(|e| SyncError::Database(format!("Failed to prune completed items: {e}")))
    }

    /// Delete failed items whose last attempt is before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn prune_failed(&self, cutoff: DateTime<Utc>) -> Result<usize, SyncError> {
        self.db
            .connection()
            .execute(
                r"DELETE FROM sync_queue
                  WHERE status = 'failed' AND COALESCE(last_attempt, created_at) < ?1",
                [encode_time(cutoff)],
            )
            .map_err(|e| SyncError::Database(format!("Failed to prune failed items: {e}")))
    }

    /// Item counts by status.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn counts(&self) -> Result<StatusCounts, SyncError> {
        let conn = self.db.connection();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")
            .map_err(|e| SyncError::Database(format!("Failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| SyncError::Database(format!("Failed to count items: {e}")))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row.map_err(|e| SyncError::Database(e.to_string()))?;
            let count = usize::try_from(count).unwrap_or(0);
            match status.parse::<ItemStatus>()? {
                ItemStatus::Pending => counts.pending = count,
                ItemStatus::Syncing => counts.syncing = count,
                ItemStatus::Completed => counts.completed = count,
                ItemStatus::Failed => counts.failed = count,
            }
        }

        Ok(counts)
    }

    fn query(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<QueueItem>, SyncError> {
        let conn = self.db.connection();

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| SyncError::Database(format!("Failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map(params, RawItem::from_row)
            .map_err(|e| SyncError::Database(format!("Failed to query items: {e}")))?;

        let mut items = Vec::new();
        let mut undecodable = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| SyncError::Database(e.to_string()))?;
            let (id, action_type) = (raw.id, raw.action_type.clone());
            match raw.into_item() {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!(
                        item_id = id,
                        action_type = %action_type,
                        error = %e,
                        "skipping undecodable queue item"
                    );
                    undecodable.push((id, e));
                },
            }
        }
        drop(stmt);

        for (id, error) in undecodable {
            self.quarantine(id, &error)?;
        }

        Ok(items)
    }

    /// Dead-letter a row that can no longer be decoded so it stops holding
    /// up delivery. Retention removes it like any other failed item.
    fn quarantine(&self, id: ItemId, error: &SyncError) -> Result<(), SyncError> {
        self.db
            .connection()
            .execute(
                r"UPDATE sync_queue
                  SET status = 'failed', last_error_kind = 'validation', last_error = ?2,
                      last_attempt = ?3
                  WHERE id = ?1 AND status IN ('pending', 'syncing')",
                params![id, error.to_string(), encode_time(Utc::now())],
            )
            .map_err(|e| SyncError::Database(format!("Failed to quarantine item: {e}")))?;
        Ok(())
    }
}

/// Row as stored, before payload and enum decoding.
struct RawItem {
    id: i64,
    action_type: String,
    payload: String,
    idempotency_key: String,
    created_at: String,
    attempts: u32,
    last_attempt: Option<String>,
    last_error_kind: Option<String>,
    last_error: Option<String>,
    status: String,
    prerequisite: bool,
}

impl RawItem {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            action_type: row.get(1)?,
            payload: row.get(2)?,
            idempotency_key: row.get(3)?,
            created_at: row.get(4)?,
            attempts: row.get(5)?,
            last_attempt: row.get(6)?,
            last_error_kind: row.get(7)?,
            last_error: row.get(8)?,
            status: row.get(9)?,
            prerequisite: row.get(10)?,
        })
    }

    fn into_item(self) -> Result<QueueItem, SyncError> {
        let last_error = match (self.last_error_kind, self.last_error) {
            (Some(kind), message) => Some(ItemError {
                kind: kind.parse::<ErrorKind>()?,
                message: message.unwrap_or_default(),
            }),
            (None, _) => None,
        };

        Ok(QueueItem {
            id: self.id,
            idempotency_key: self.idempotency_key,
            mutation: Mutation::from_parts(&self.action_type, &self.payload)?,
            created_at: decode_time(&self.created_at)?,
            attempts: self.attempts,
            last_attempt: self.last_attempt.as_deref().map(decode_time).transpose()?,
            last_error,
            status: self.status.parse()?,
            prerequisite: self.prerequisite,
        })
    }
}

fn insert_item(conn: &Connection, item: NewItem) -> Result<QueueItem, SyncError> {
    let payload = item.mutation.body()?.to_string();
    let created_at = item.created_at.trunc_subsecs(6);

    conn.execute(
        r"INSERT INTO sync_queue
          (action_type, payload, idempotency_key, created_at, attempts, status, prerequisite)
          VALUES (?1, ?2, ?3, ?4, 0, 'pending', ?5)",
        params![
            item.mutation.action_name(),
            payload,
            item.idempotency_key,
            encode_time(created_at),
            item.prerequisite,
        ],
    )
    .map_err(|e| SyncError::Database(format!("Failed to append item: {e}")))?;

    let id = conn.last_insert_rowid();
    debug!(item_id = id, action = item.mutation.action_name(), "appended queue item");

    Ok(QueueItem {
        id,
        idempotency_key: item.idempotency_key,
        mutation: item.mutation,
        created_at,
        attempts: 0,
        last_attempt: None,
        last_error: None,
        status: ItemStatus::Pending,
        prerequisite: item.prerequisite,
    })
}

/// Fixed-width UTC timestamps sort lexically in time order.
fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(s: &str) -> Result<DateTime<Utc>, SyncError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::Parse(format!("Invalid timestamp {s}: {e}")))
}
