use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::SyncError;
use crate::features::sync::{ItemError, ItemId, ItemStatus, QueueItem};

/// Queue item as shown to users. Payloads stay out of the output.
#[derive(Debug, Serialize)]
pub struct ItemView<'a> {
    pub id: ItemId,
    pub action_type: &'static str,
    pub targets: Vec<String>,
    pub status: ItemStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<&'a ItemError>,
    pub prerequisite: bool,
}

impl<'a> From<&'a QueueItem> for ItemView<'a> {
    fn from(item: &'a QueueItem) -> Self {
        Self {
            id: item.id,
            action_type: item.action_type(),
            targets: item.mutation.entity_keys(),
            status: item.status,
            attempts: item.attempts,
            created_at: item.created_at,
            last_attempt: item.last_attempt,
            last_error: item.last_error.as_ref(),
            prerequisite: item.prerequisite,
        }
    }
}

#[derive(Serialize)]
struct ItemListOutput<'a> {
    status: ItemStatus,
    count: usize,
    items: Vec<ItemView<'a>>,
}

/// Format queue items as JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_items_json(items: &[QueueItem], status: ItemStatus) -> Result<String, SyncError> {
    to_json(&ItemListOutput {
        status,
        count: items.len(),
        items: items.iter().map(ItemView::from).collect(),
    })
}

/// Serialize any value as pretty-printed JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn to_json<T: Serialize>(value: &T) -> Result<String, SyncError> {
    Ok(serde_json::to_string_pretty(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::sync::{ErrorKind, Mutation, NewItem};
    use crate::features::sync::mutation::AssignmentUpdate;

    fn make_item() -> QueueItem {
        let new = NewItem::new(Mutation::UpdateAssignment(AssignmentUpdate {
            id: "A1".to_string(),
            description: Some("private notes".to_string()),
            ..AssignmentUpdate::default()
        }));
        QueueItem {
            id: 3,
            idempotency_key: new.idempotency_key,
            mutation: new.mutation,
            created_at: new.created_at,
            attempts: 2,
            last_attempt: None,
            last_error: Some(ItemError {
                kind: ErrorKind::Transient,
                message: "503".to_string(),
            }),
            status: ItemStatus::Pending,
            prerequisite: false,
        }
    }

    #[test]
    fn test_format_items_json() {
        let json = format_items_json(&[make_item()], ItemStatus::Pending).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["status"], "pending");
        assert_eq!(parsed["count"], 1);
        assert_eq!(parsed["items"][0]["action_type"], "update-assignment");
        assert_eq!(parsed["items"][0]["targets"][0], "assignment:A1");
        assert_eq!(parsed["items"][0]["last_error"]["kind"], "transient");
    }

    #[test]
    fn test_format_items_json_hides_payload() {
        let json = format_items_json(&[make_item()], ItemStatus::Pending).unwrap();
        assert!(!json.contains("private notes"));
    }

    #[test]
    fn test_to_json() {
        let json = to_json(&serde_json::json!({"requeued": 2})).unwrap();
        assert!(json.contains("\"requeued\": 2"));
    }
}
