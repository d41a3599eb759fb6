//! Feature implementations for studysync.
//!
//! - Sync queue: durable storage, ordered delivery, retries and connectivity
//! - Batch actions: multi-item delete, restore and permanent delete

pub mod batch;
pub mod sync;
