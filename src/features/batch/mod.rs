//! Batch actions on academic items.
//!
//! Deletes, restores and permanent deletes applied to several rows at once.
//! Online calls go straight to the backend; offline calls are queued as a
//! single item.

mod operations;

pub use operations::{BatchActions, BatchOutcome, BatchResult, BatchSummary};
