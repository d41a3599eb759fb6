//! Path resolution for studysync data files.
//!
//! All data is stored in `~/.studysync/` unless a different root is given:
//! - `config.yaml` - Queue, retry and network settings
//! - `queue.db` - SQLite database holding the persistent mutation queue

use std::path::PathBuf;

use crate::error::SyncError;

/// Paths to the studysync data directory and its files.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Root directory: `~/.studysync/`
    pub root: PathBuf,
    /// Config file: `~/.studysync/config.yaml`
    pub config_file: PathBuf,
    /// Database file: `~/.studysync/queue.db`
    pub database: PathBuf,
}

impl Paths {
    /// Create paths based on the user's home directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn new() -> Result<Self, SyncError> {
        let home = std::env::var("HOME")
            .map_err(|_| SyncError::Config("Could not determine home directory".to_string()))?;

        Ok(Self::with_root(PathBuf::from(home).join(".studysync")))
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            config_file: root.join("config.yaml"),
            database: root.join("queue.db"),
            root,
        }
    }

    /// Ensure the root directory exists, creating it if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn ensure_dirs(&self) -> Result<(), SyncError> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root).map_err(|e| {
                SyncError::Config(format!(
                    "Failed to create directory {}: {e}",
                    self.root.display()
                ))
            })?;
        }
        Ok(())
    }
}
