//! studysync - offline-first mutation queue for a study planner
//!
//! User edits are queued durably in SQLite and delivered to the backend in
//! order once connectivity allows, with classified retries, a dead-letter
//! state and batch actions that fall back to the queue when offline.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod features;
pub mod logging;
pub mod output;
pub mod storage;

pub use cli::args::{Cli, Commands, OutputFormat};
pub use error::SyncError;
pub use features::batch::BatchActions;
pub use features::sync::SyncEngine;
