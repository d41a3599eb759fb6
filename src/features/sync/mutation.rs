//! Mutation types for the sync queue.
//!
//! Defines the mutations a user can make while offline, their typed payloads,
//! and the durable [`QueueItem`] that wraps each one.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::remote::ErrorKind;
use super::retry::OperationClass;
use crate::error::SyncError;

/// Identifier assigned to a queue item when it is appended.
pub type ItemId = i64;

/// Tables that hold academic items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemTable {
    Assignments,
    Lectures,
    StudySessions,
}

impl ItemTable {
    /// Ordering scope key for one row of this table.
    #[must_use]
    pub fn entity_key(self, id: &str) -> String {
        let kind = match self {
            Self::Assignments => "assignment",
            Self::Lectures => "lecture",
            Self::StudySessions => "study_session",
        };
        format!("{kind}:{id}")
    }

    /// Cache query key for list views of this table.
    #[must_use]
    pub const fn list_query_key(self) -> &'static str {
        match self {
            Self::Assignments => "assignments",
            Self::Lectures => "lectures",
            Self::StudySessions => "study_sessions",
        }
    }
}

/// Payload for creating an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentPayload {
    /// Client-generated id, so later edits can target the new row.
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Payload for updating an assignment. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Payload for creating a lecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LecturePayload {
    pub id: String,
    pub title: String,
    pub course_id: String,
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Payload for updating a lecture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LectureUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Payload for creating a study session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudySessionPayload {
    pub id: String,
    pub title: String,
    pub scheduled_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
}

/// Payload for updating a study session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudySessionUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
}

/// Payload naming a single row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: String,
}

/// Payload for toggling completion on an assignment or study session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub id: String,
    pub table: ItemTable,
    pub completed: bool,
}

/// Payload for syncing user preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferencesPayload {
    pub preferences: Value,
}

/// What a batch action does to its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchOperation {
    /// Move items to the trash.
    Delete,
    /// Bring items back from the trash.
    Restore,
    /// Remove items for good.
    PermanentDelete,
}

impl std::fmt::Display for BatchOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Delete => "delete",
            Self::Restore => "restore",
            Self::PermanentDelete => "permanent-delete",
        };
        write!(f, "{s}")
    }
}

/// One row targeted by a batch action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchMember {
    pub id: String,
    pub table: ItemTable,
}

/// Payload for a batch action. Delivered as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPayload {
    pub operation: BatchOperation,
    pub items: Vec<BatchMember>,
}

/// Per-member outcome reported by the backend for a batch action.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct MemberResult {
    id: String,
    #[serde(default)]
    table: Option<ItemTable>,
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    results: Vec<MemberResult>,
}

/// A batch member the backend did not apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub member: BatchMember,
    pub error: String,
}

/// Batch members split by backend outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResults {
    pub succeeded: Vec<BatchMember>,
    pub failed: Vec<BatchFailure>,
}

impl BatchPayload {
    /// Split members by the `results` breakdown in a backend response.
    ///
    /// A response without a breakdown counts every member as applied. A
    /// member missing from the breakdown counts as not applied.
    #[must_use]
    pub fn results(&self, response: &Value) -> BatchResults {
        let Ok(parsed) = serde_json::from_value::<BatchResponse>(response.clone()) else {
            return BatchResults {
                succeeded: self.items.clone(),
                failed: Vec::new(),
            };
        };

        let mut results = BatchResults::default();
        for member in &self.items {
            let reported = parsed
                .results
                .iter()
                .find(|r| r.id == member.id && r.table.map_or(true, |t| t == member.table));
            match reported {
                Some(r) if r.success => results.succeeded.push(member.clone()),
                Some(r) => results.failed.push(BatchFailure {
                    member: member.clone(),
                    error: r.error.clone().unwrap_or_else(|| "failed".to_string()),
                }),
                None => results.failed.push(BatchFailure {
                    member: member.clone(),
                    error: "no result reported".to_string(),
                }),
            }
        }
        results
    }
}

/// A user mutation that can be queued, tagged by its action name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", content = "payload", rename_all = "kebab-case")]
pub enum Mutation {
    CreateAssignment(AssignmentPayload),
    UpdateAssignment(AssignmentUpdate),
    DeleteAssignment(EntityRef),
    CreateLecture(LecturePayload),
    UpdateLecture(LectureUpdate),
    DeleteLecture(EntityRef),
    CreateStudySession(StudySessionPayload),
    UpdateStudySession(StudySessionUpdate),
    ToggleTaskCompletion(TaskCompletion),
    UpdatePreferences(PreferencesPayload),
    BatchAction(BatchPayload),
}

impl Mutation {
    /// Remote action name, also the persisted `action_type`.
    #[must_use]
    pub const fn action_name(&self) -> &'static str {
        match self {
            Self::CreateAssignment(_) => "create-assignment",
            Self::UpdateAssignment(_) => "update-assignment",
            Self::DeleteAssignment(_) => "delete-assignment",
            Self::CreateLecture(_) => "create-lecture",
            Self::UpdateLecture(_) => "update-lecture",
            Self::DeleteLecture(_) => "delete-lecture",
            Self::CreateStudySession(_) => "create-study-session",
            Self::UpdateStudySession(_) => "update-study-session",
            Self::ToggleTaskCompletion(_) => "toggle-task-completion",
            Self::UpdatePreferences(_) => "update-preferences",
            Self::BatchAction(_) => "batch-action",
        }
    }

    /// Retry class for this mutation.
    #[must_use]
    pub const fn class(&self) -> OperationClass {
        match self {
            // Losing these silently would drop deletions the user confirmed
            Self::DeleteAssignment(_) | Self::DeleteLecture(_) | Self::BatchAction(_) => {
                OperationClass::Critical
            },
            Self::UpdatePreferences(_) => OperationClass::Background,
            _ => OperationClass::Normal,
        }
    }

    /// Entities this mutation touches. Items sharing a key are delivered in
    /// enqueue order.
    #[must_use]
    pub fn entity_keys(&self) -> Vec<String> {
        match self {
            Self::CreateAssignment(p) => vec![ItemTable::Assignments.entity_key(&p.id)],
            Self::UpdateAssignment(p) => vec![ItemTable::Assignments.entity_key(&p.id)],
            Self::DeleteAssignment(p) => vec![ItemTable::Assignments.entity_key(&p.id)],
            Self::CreateLecture(p) => vec![ItemTable::Lectures.entity_key(&p.id)],
            Self::UpdateLecture(p) => vec![ItemTable::Lectures.entity_key(&p.id)],
            Self::DeleteLecture(p) => vec![ItemTable::Lectures.entity_key(&p.id)],
            Self::CreateStudySession(p) => vec![ItemTable::StudySessions.entity_key(&p.id)],
            Self::UpdateStudySession(p) => vec![ItemTable::StudySessions.entity_key(&p.id)],
            Self::ToggleTaskCompletion(p) => vec![p.table.entity_key(&p.id)],
            Self::UpdatePreferences(_) => vec!["preferences".to_string()],
            Self::BatchAction(p) => p
                .items
                .iter()
                .map(|m| m.table.entity_key(&m.id))
                .collect(),
        }
    }

    /// Stable description of the target, used to derive idempotency keys.
    #[must_use]
    pub fn target(&self) -> String {
        match self {
            Self::BatchAction(p) => {
                let mut keys = self.entity_keys();
                keys.sort();
                format!("{}[{}]", p.operation, keys.join(","))
            },
            _ => self.entity_keys().join(","),
        }
    }

    /// Cache query keys to invalidate once this mutation is delivered.
    #[must_use]
    pub fn cache_keys(&self) -> Vec<String> {
        match self {
            Self::CreateAssignment(_)
            | Self::UpdateAssignment(_)
            | Self::DeleteAssignment(_)
            | Self::CreateLecture(_)
            | Self::UpdateLecture(_)
            | Self::DeleteLecture(_)
            | Self::CreateStudySession(_)
            | Self::UpdateStudySession(_)
            | Self::ToggleTaskCompletion(_) => {
                let table = self.table().unwrap_or(ItemTable::Assignments);
                let mut keys = vec![
                    table.list_query_key().to_string(),
                    "dashboard".to_string(),
                ];
                keys.extend(self.entity_keys());
                keys
            },
            Self::UpdatePreferences(_) => vec!["preferences".to_string()],
            Self::BatchAction(p) => batch_cache_keys(p.items.iter()),
        }
    }

    /// Cache query keys to invalidate given the backend's response.
    ///
    /// Batch actions only invalidate members the backend reports as applied.
    #[must_use]
    pub fn invalidation_keys(&self, response: &Value) -> Vec<String> {
        match self {
            Self::BatchAction(p) => batch_cache_keys(p.results(response).succeeded.iter()),
            _ => self.cache_keys(),
        }
    }

    fn table(&self) -> Option<ItemTable> {
        match self {
            Self::CreateAssignment(_) | Self::UpdateAssignment(_) | Self::DeleteAssignment(_) => {
                Some(ItemTable::Assignments)
            },
            Self::CreateLecture(_) | Self::UpdateLecture(_) | Self::DeleteLecture(_) => {
                Some(ItemTable::Lectures)
            },
            Self::CreateStudySession(_) | Self::UpdateStudySession(_) => {
                Some(ItemTable::StudySessions)
            },
            Self::ToggleTaskCompletion(p) => Some(p.table),
            Self::UpdatePreferences(_) | Self::BatchAction(_) => None,
        }
    }

    /// Request body sent to the remote action.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn body(&self) -> Result<Value, SyncError> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    /// Rebuild a mutation from its persisted action name and payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the action is unknown or the payload does not
    /// match it.
    pub fn from_parts(action_type: &str, payload: &str) -> Result<Self, SyncError> {
        let payload: Value = serde_json::from_str(payload)?;
        serde_json::from_value(json!({ "action_type": action_type, "payload": payload }))
            .map_err(|e| SyncError::Parse(format!("Invalid {action_type} payload: {e}")))
    }
}

impl std::fmt::Display for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.action_name())
    }
}

/// Cache keys for a set of batch members: every touched list, the trash view,
/// the dashboard and each member row.
pub fn batch_cache_keys<'a>(members: impl Iterator<Item = &'a BatchMember>) -> Vec<String> {
    let mut lists = Vec::new();
    let mut rows = Vec::new();
    for member in members {
        let list = member.table.list_query_key().to_string();
        if !lists.contains(&list) {
            lists.push(list);
        }
        rows.push(member.table.entity_key(&member.id));
    }
    if rows.is_empty() {
        return Vec::new();
    }
    lists.push("trash".to_string());
    lists.push("dashboard".to_string());
    lists.extend(rows);
    lists
}

/// Status of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting for delivery
    Pending,
    /// Remote call in flight
    Syncing,
    /// Delivered
    Completed,
    /// Dead-lettered: non-retryable error or retries exhausted
    Failed,
}

impl ItemStatus {
    /// Check if this status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Terminal states never change; `syncing -> pending` is the only
    /// backwards step.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Pending | Self::Syncing | Self::Failed)
                | (Self::Syncing, Self::Pending | Self::Completed | Self::Failed)
        )
    }

    /// Stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SyncError::Parse(format!("Unknown item status: {other}"))),
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Last failure recorded on an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ErrorKind,
    pub message: String,
}

/// A durable unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Assigned at append, stable for the item's lifetime.
    pub id: ItemId,
    /// Sent with every attempt so the backend can drop duplicates.
    pub idempotency_key: String,
    /// Action type and typed payload.
    pub mutation: Mutation,
    /// Enqueue time, primary ordering key.
    pub created_at: DateTime<Utc>,
    /// Delivery attempts made so far.
    pub attempts: u32,
    /// Time of the most recent attempt.
    pub last_attempt: Option<DateTime<Utc>>,
    /// Last failure, cleared on success.
    pub last_error: Option<ItemError>,
    /// Lifecycle status.
    pub status: ItemStatus,
    /// Later items depend on this one's effects.
    pub prerequisite: bool,
}

impl QueueItem {
    /// Remote action name of the wrapped mutation.
    #[must_use]
    pub const fn action_type(&self) -> &'static str {
        self.mutation.action_name()
    }
}

/// An item about to be appended; the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub mutation: Mutation,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub prerequisite: bool,
}

impl NewItem {
    /// Prepare a mutation for enqueueing with a fresh idempotency key.
    #[must_use]
    pub fn new(mutation: Mutation) -> Self {
        let idempotency_key =
            idempotency_key(mutation.action_name(), &mutation.target(), &client_nonce());
        Self {
            mutation,
            idempotency_key,
            created_at: Utc::now(),
            prerequisite: false,
        }
    }

    /// Mark this item's effects as a prerequisite of later items.
    #[must_use]
    pub const fn as_prerequisite(mut self) -> Self {
        self.prerequisite = true;
        self
    }
}

/// Random per-action nonce so two identical user actions get distinct keys.
#[must_use]
pub fn client_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Derive the idempotency key for an action on a target.
///
/// Deterministic in its inputs.
#[must_use]
pub fn idempotency_key(action: &str, target: &str, nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action.as_bytes());
    hasher.update([0u8]);
    hasher.update(target.as_bytes());
    hasher.update([0u8]);
    hasher.update(nonce.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(ids: &[&str]) -> Mutation {
        Mutation::BatchAction(BatchPayload {
            operation: BatchOperation::Delete,
            items: ids
                .iter()
                .map(|id| BatchMember {
                    id: (*id).to_string(),
                    table: ItemTable::Assignments,
                })
                .collect(),
        })
    }

    #[test]
    fn test_action_names_match_serde_tags() {
        let m = Mutation::DeleteLecture(EntityRef {
            id: "L1".to_string(),
        });
        let tagged = serde_json::to_value(&m).unwrap();
        assert_eq!(tagged["action_type"], m.action_name());
        assert_eq!(batch(&["a"]).action_name(), "batch-action");
    }

    #[test]
    fn test_body_and_from_parts() {
        let m = Mutation::UpdateLecture(LectureUpdate {
            id: "L1".to_string(),
            location: Some("Room 4".to_string()),
            ..LectureUpdate::default()
        });
        let body = m.body().unwrap();
        assert_eq!(body["id"], "L1");
        assert_eq!(body["location"], "Room 4");
        assert!(body.get("title").is_none());

        let rebuilt = Mutation::from_parts("update-lecture", &body.to_string()).unwrap();
        assert_eq!(rebuilt, m);
    }

    #[test]
    fn test_from_parts_rejects_unknown_action() {
        let err = Mutation::from_parts("launch-rocket", "{}").unwrap_err();
        assert!(matches!(err, SyncError::Parse(_)));
    }

    #[test]
    fn test_from_parts_rejects_mismatched_payload() {
        let err = Mutation::from_parts("create-assignment", r#"{"id": "a"}"#).unwrap_err();
        assert!(matches!(err, SyncError::Parse(_)));
    }

    #[test]
    fn test_classes() {
        assert_eq!(batch(&["a"]).class(), OperationClass::Critical);
        assert_eq!(
            Mutation::UpdatePreferences(PreferencesPayload {
                preferences: json!({"theme": "dark"})
            })
            .class(),
            OperationClass::Background
        );
        assert_eq!(
            Mutation::UpdateAssignment(AssignmentUpdate {
                id: "a".to_string(),
                ..AssignmentUpdate::default()
            })
            .class(),
            OperationClass::Normal
        );
    }

    #[test]
    fn test_entity_keys_share_scope_across_actions() {
        let create = Mutation::CreateAssignment(AssignmentPayload {
            id: "A1".to_string(),
            title: "Essay".to_string(),
            course_id: None,
            due_date: None,
            description: None,
        });
        let update = Mutation::UpdateAssignment(AssignmentUpdate {
            id: "A1".to_string(),
            title: Some("Essay v2".to_string()),
            ..AssignmentUpdate::default()
        });
        assert_eq!(create.entity_keys(), update.entity_keys());
        assert_eq!(create.entity_keys(), vec!["assignment:A1".to_string()]);
        assert_eq!(
            batch(&["a", "b"]).entity_keys(),
            vec!["assignment:a".to_string(), "assignment:b".to_string()]
        );
    }

    #[test]
    fn test_batch_target_is_order_independent() {
        assert_eq!(batch(&["a", "b"]).target(), batch(&["b", "a"]).target());
    }

    #[test]
    fn test_batch_cache_keys() {
        let keys = batch(&["a", "b"]).cache_keys();
        assert!(keys.contains(&"assignments".to_string()));
        assert!(keys.contains(&"trash".to_string()));
        assert!(keys.contains(&"assignment:b".to_string()));
        assert!(batch_cache_keys(std::iter::empty()).is_empty());
    }

    #[test]
    fn test_status_transitions() {
        use ItemStatus::{Completed, Failed, Pending, Syncing};

        assert!(Pending.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Pending));
        assert!(Syncing.can_transition_to(Completed));
        assert!(Syncing.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Syncing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("SYNCING".parse::<ItemStatus>().unwrap(), ItemStatus::Syncing);
        assert!("skipped".parse::<ItemStatus>().is_err());
        assert!(ItemStatus::Failed.is_terminal());
        assert!(!ItemStatus::Syncing.is_terminal());
    }

    #[test]
    fn test_idempotency_key_deterministic() {
        let k1 = idempotency_key("delete-lecture", "lecture:L1", "n1");
        let k2 = idempotency_key("delete-lecture", "lecture:L1", "n1");
        let k3 = idempotency_key("delete-lecture", "lecture:L1", "n2");
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1.len(), 32);
    }

    #[test]
    fn test_new_items_get_distinct_keys() {
        let a = NewItem::new(batch(&["a"]));
        let b = NewItem::new(batch(&["a"]));
        assert_ne!(a.idempotency_key, b.idempotency_key);
        assert!(!a.prerequisite);
        assert!(a.as_prerequisite().prerequisite);
    }

    #[test]
    fn test_batch_results_follow_breakdown() {
        let Mutation::BatchAction(payload) = batch(&["a", "b", "c"]) else {
            unreachable!()
        };
        let response = json!({
            "results": [
                { "id": "a", "success": true },
                { "id": "b", "success": false, "error": "not found" }
            ]
        });

        let results = payload.results(&response);
        assert_eq!(results.succeeded.len(), 1);
        assert_eq!(results.succeeded[0].id, "a");
        assert_eq!(results.failed.len(), 2);
        assert_eq!(results.failed[0].error, "not found");
        assert_eq!(results.failed[1].member.id, "c");
    }

    #[test]
    fn test_batch_without_breakdown_counts_all_applied() {
        let Mutation::BatchAction(payload) = batch(&["a", "b"]) else {
            unreachable!()
        };
        let results = payload.results(&json!({ "ok": true }));
        assert_eq!(results.succeeded.len(), 2);
        assert!(results.failed.is_empty());
    }

    #[test]
    fn test_invalidation_keys_skip_unapplied_members() {
        let mutation = batch(&["a", "b"]);
        let response = json!({
            "results": [
                { "id": "a", "success": true },
                { "id": "b", "success": false }
            ]
        });
        let keys = mutation.invalidation_keys(&response);
        assert!(keys.contains(&"assignment:a".to_string()));
        assert!(!keys.contains(&"assignment:b".to_string()));

        let none = mutation.invalidation_keys(&json!({ "results": [] }));
        assert!(none.is_empty());
    }
}
