//! Output formatting for studysync.
//!
//! This module provides formatters for displaying queue state in various
//! formats.

mod json;
mod pretty;

use crate::cli::args::OutputFormat;
use crate::error::SyncError;
use crate::features::sync::{ItemStatus, QueueItem, QueueStats};

pub use json::*;
pub use pretty::*;

/// Format queue stats based on output format
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_stats(stats: &QueueStats, format: OutputFormat) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_stats_pretty(stats)),
        OutputFormat::Json => to_json(stats),
    }
}

/// Format queue items based on output format
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_items(
    items: &[QueueItem],
    status: ItemStatus,
    format: OutputFormat,
) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_items_pretty(items, status)),
        OutputFormat::Json => format_items_json(items, status),
    }
}
