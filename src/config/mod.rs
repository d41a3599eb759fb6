//! Configuration management for studysync.
//!
//! This module handles loading and saving configuration from the data
//! directory (`~/.studysync/` by default).

mod paths;
mod settings;

pub use paths::Paths;
pub use settings::{Config, NetworkConfig, QueueConfig, RetryClassConfig, RetryConfig};
