//! Error types for studysync.

use thiserror::Error;

/// Errors raised by the queue store, configuration layer and engine API.
///
/// Delivery failures never surface here: they are recorded on the queue item
/// as an [`InvokeError`](crate::features::sync::InvokeError) instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The persistent queue already holds as many items as it may.
    #[error("Sync queue is full ({capacity} items)")]
    QueueFull {
        /// Configured store capacity.
        capacity: usize,
    },

    /// Underlying SQLite failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration could not be loaded or saved.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A queue item or other resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored or supplied data could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The requested transition is not allowed from the item's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl SyncError {
    /// Whether this is the synchronous "store is full" rejection from enqueue.
    #[must_use]
    pub const fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
}
