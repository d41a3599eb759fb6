//! Sync queue command implementation.
//!
//! Works on the store directly. Opening a full engine would run crash
//! recovery, which must not happen while the app may be delivering items.

use chrono::Utc;
use colored::Colorize;
use tracing::debug;

use crate::cli::args::{OutputFormat, SyncCommands};
use crate::config::{Config, Paths};
use crate::error::SyncError;
use crate::features::sync::{ItemId, ItemStatus, QueueStats, QueueStore};
use crate::output::{format_items, format_stats, to_json};
use crate::storage::Database;

/// Open the queue under `paths`, creating the directory on first use.
///
/// # Errors
///
/// Returns an error if the config cannot be parsed or the database cannot
/// be opened.
pub fn open_store(paths: &Paths) -> Result<QueueStore, SyncError> {
    paths.ensure_dirs()?;
    let config = Config::load_from_path(&paths.config_file)?;
    let db = Database::open_at(&paths.database)?;
    debug!(path = %paths.database.display(), "Opened sync queue");
    Ok(QueueStore::new(db, &config.queue))
}

/// Execute sync subcommands.
///
/// # Errors
///
/// Returns an error if the store cannot be opened, the target item does
/// not exist or is in the wrong state, or output formatting fails.
pub fn sync(paths: &Paths, cmd: SyncCommands, format: OutputFormat) -> Result<String, SyncError> {
    let store = open_store(paths)?;

    match cmd {
        SyncCommands::Status => show_status(&store, format),
        SyncCommands::List { status, limit } => list_items(&store, status.as_deref(), limit, format),
        SyncCommands::Retry { all, id } => retry_items(&store, all, id, format),
        SyncCommands::Dismiss { id } => dismiss_item(&store, id, format),
        SyncCommands::Cancel { id } => cancel_item(&store, id, format),
        SyncCommands::Clear => clear_expired(&store, format),
        SyncCommands::Recover => recover_items(&store, format),
    }
}

/// Show queue status.
fn show_status(store: &QueueStore, format: OutputFormat) -> Result<String, SyncError> {
    let stats = QueueStats::from_counts(store.counts()?, false);
    format_stats(&stats, format)
}

/// List queued mutations with a given status.
fn list_items(
    store: &QueueStore,
    status_filter: Option<&str>,
    limit: usize,
    format: OutputFormat,
) -> Result<String, SyncError> {
    let status = status_filter
        .map(str::parse::<ItemStatus>)
        .transpose()?
        .unwrap_or(ItemStatus::Pending);

    let mut items = store.by_status(status)?;
    items.truncate(limit);

    format_items(&items, status, format)
}

/// Requeue failed mutations.
fn retry_items(
    store: &QueueStore,
    all: bool,
    id: Option<ItemId>,
    format: OutputFormat,
) -> Result<String, SyncError> {
    if let Some(item_id) = id {
        let item = store.requeue_failed(item_id)?;

        match format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "requeued": [{ "previous_id": item_id, "id": item.id }],
            })),
            OutputFormat::Pretty => Ok(format!(
                "Requeued {} {} as {}",
                item.action_type(),
                format!("#{item_id}").dimmed(),
                format!("#{}", item.id).bold()
            )),
        }
    } else if all {
        let items = store.requeue_all_failed()?;

        match format {
            OutputFormat::Json => {
                let ids: Vec<ItemId> = items.iter().map(|item| item.id).collect();
                to_json(&serde_json::json!({ "requeued": ids.len(), "ids": ids }))
            },
            OutputFormat::Pretty => {
                if items.is_empty() {
                    Ok("No failed mutations to retry.".to_string())
                } else {
                    Ok(format!("Requeued {} failed mutations", items.len()))
                }
            },
        }
    } else {
        Err(SyncError::Config(
            "Specify --all or provide a mutation ID".to_string(),
        ))
    }
}

/// Discard a failed mutation.
fn dismiss_item(store: &QueueStore, id: ItemId, format: OutputFormat) -> Result<String, SyncError> {
    let item = store.dismiss_failed(id)?;

    match format {
        OutputFormat::Json => to_json(&serde_json::json!({ "dismissed": id })),
        OutputFormat::Pretty => Ok(format!(
            "Dismissed {} {}",
            item.action_type(),
            format!("#{id}").dimmed()
        )),
    }
}

/// Withdraw a pending mutation.
fn cancel_item(store: &QueueStore, id: ItemId, format: OutputFormat) -> Result<String, SyncError> {
    let item = store.cancel_pending(id)?;

    match format {
        OutputFormat::Json => to_json(&serde_json::json!({ "cancelled": id })),
        OutputFormat::Pretty => Ok(format!(
            "Cancelled {} {}",
            item.action_type(),
            format!("#{id}").dimmed()
        )),
    }
}

/// Remove completed and failed entries past retention.
fn clear_expired(store: &QueueStore, format: OutputFormat) -> Result<String, SyncError> {
    let report = store.prune_expired(Utc::now())?;

    match format {
        OutputFormat::Json => to_json(&report),
        OutputFormat::Pretty => Ok(format!(
            "Cleared {} completed and {} failed entries",
            report.completed, report.failed
        )),
    }
}

/// Return interrupted mutations to pending.
fn recover_items(store: &QueueStore, format: OutputFormat) -> Result<String, SyncError> {
    let count = store.recover_in_flight()?;

    match format {
        OutputFormat::Json => to_json(&serde_json::json!({ "recovered": count })),
        OutputFormat::Pretty => Ok(format!("Returned {count} interrupted mutations to pending")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::sync::mutation::EntityRef;
    use crate::features::sync::{ItemPatch, Mutation, NewItem};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Paths) {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_root(dir.path().join("studysync"));
        (dir, paths)
    }

    fn delete_lecture(id: &str) -> NewItem {
        NewItem::new(Mutation::DeleteLecture(EntityRef { id: id.to_string() }))
    }

    fn json(output: &str) -> serde_json::Value {
        serde_json::from_str(output).unwrap()
    }

    #[test]
    fn test_status_on_fresh_directory() {
        let (_dir, paths) = setup();

        let output = sync(&paths, SyncCommands::Status, OutputFormat::Json).unwrap();

        let value = json(&output);
        assert_eq!(value["pending"], 0);
        assert_eq!(value["failed"], 0);
        assert_eq!(value["is_syncing"], false);
        assert!(paths.database.exists());
    }

    #[test]
    fn test_list_defaults_to_pending_and_applies_limit() {
        let (_dir, paths) = setup();
        let store = open_store(&paths).unwrap();
        for id in ["L1", "L2", "L3"] {
            store.append(delete_lecture(id)).unwrap();
        }

        let output = sync(
            &paths,
            SyncCommands::List {
                status: None,
                limit: 2,
            },
            OutputFormat::Json,
        )
        .unwrap();

        let value = json(&output);
        assert_eq!(value["status"], "pending");
        assert_eq!(value["count"], 2);
        assert_eq!(value["items"][0]["targets"][0], "lecture:L1");
    }

    #[test]
    fn test_list_rejects_unknown_status() {
        let (_dir, paths) = setup();

        let err = sync(
            &paths,
            SyncCommands::List {
                status: Some("stuck".to_string()),
                limit: 20,
            },
            OutputFormat::Pretty,
        )
        .unwrap_err();

        assert!(matches!(err, SyncError::Parse(_)));
    }

    #[test]
    fn test_retry_requires_target() {
        let (_dir, paths) = setup();

        let err = sync(
            &paths,
            SyncCommands::Retry { all: false, id: None },
            OutputFormat::Pretty,
        )
        .unwrap_err();

        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_retry_and_dismiss_failed_items() {
        let (_dir, paths) = setup();
        let store = open_store(&paths).unwrap();
        let first = store.append(delete_lecture("L1")).unwrap();
        let second = store.append(delete_lecture("L2")).unwrap();
        for item in [&first, &second] {
            store
                .update(item.id, &ItemPatch::status(ItemStatus::Syncing))
                .unwrap();
            store
                .update(item.id, &ItemPatch::status(ItemStatus::Failed))
                .unwrap();
        }

        let output = sync(
            &paths,
            SyncCommands::Retry {
                all: false,
                id: Some(first.id),
            },
            OutputFormat::Json,
        )
        .unwrap();
        let value = json(&output);
        assert_eq!(value["requeued"][0]["previous_id"], first.id);

        let requeued = store.list_pending().unwrap();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].idempotency_key, first.idempotency_key);

        sync(
            &paths,
            SyncCommands::Dismiss { id: second.id },
            OutputFormat::Pretty,
        )
        .unwrap();
        assert!(store.get(second.id).unwrap().is_none());
    }

    #[test]
    fn test_dismiss_missing_item() {
        let (_dir, paths) = setup();

        let err = sync(&paths, SyncCommands::Dismiss { id: 99 }, OutputFormat::Pretty)
            .unwrap_err();

        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn test_cancel_and_recover() {
        let (_dir, paths) = setup();
        let store = open_store(&paths).unwrap();
        let waiting = store.append(delete_lecture("L1")).unwrap();
        let stuck = store.append(delete_lecture("L2")).unwrap();
        store
            .update(stuck.id, &ItemPatch::status(ItemStatus::Syncing))
            .unwrap();

        sync(
            &paths,
            SyncCommands::Cancel { id: waiting.id },
            OutputFormat::Pretty,
        )
        .unwrap();
        let output = sync(&paths, SyncCommands::Recover, OutputFormat::Json).unwrap();

        assert_eq!(json(&output)["recovered"], 1);
        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, stuck.id);
    }

    #[test]
    fn test_clear_keeps_recent_entries() {
        let (_dir, paths) = setup();
        let store = open_store(&paths).unwrap();
        let item = store.append(delete_lecture("L1")).unwrap();
        store
            .update(item.id, &ItemPatch::status(ItemStatus::Syncing))
            .unwrap();
        store
            .update(item.id, &ItemPatch::status(ItemStatus::Completed))
            .unwrap();

        let output = sync(&paths, SyncCommands::Clear, OutputFormat::Json).unwrap();

        assert_eq!(json(&output)["completed"], 0);
        assert!(store.get(item.id).unwrap().is_some());
    }
}
