use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::{Deserialize, Serialize};

use crate::features::sync::ItemId;

/// studysync - inspect and manage the offline mutation queue
///
/// Shows what is waiting to sync, what failed, and lets you retry, dismiss
/// or cancel queued mutations. Delivery itself happens in the app.
#[derive(Parser)]
#[command(name = "studysync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output format for command results
    ///
    /// Use 'pretty' for human-readable colored output (default),
    /// or 'json' for machine-readable output suitable for scripting.
    #[arg(short, long, value_enum, default_value = "pretty", global = true)]
    pub output: OutputFormat,

    /// Directory holding config.yaml and queue.db
    ///
    /// Defaults to ~/.studysync.
    #[arg(long, env = "STUDYSYNC_HOME", global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for command results.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable colored output.
    #[default]
    Pretty,
    /// Machine-readable JSON output.
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sync queue management
    ///
    /// # Subcommands
    ///
    ///   status   Show queue counts
    ///   list     List queued mutations
    ///   retry    Requeue failed mutations
    ///   dismiss  Discard a failed mutation
    ///   cancel   Withdraw a pending mutation
    ///   clear    Remove expired completed and failed entries
    ///   recover  Return interrupted mutations to pending
    Sync(SyncArgs),

    /// Generate shell completions
    ///
    /// Example: studysync completions zsh > ~/.zsh/completions/_studysync
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct SyncArgs {
    #[command(subcommand)]
    pub command: SyncCommands,
}

/// Sync queue subcommands.
#[derive(Subcommand)]
pub enum SyncCommands {
    /// Show sync queue status
    ///
    /// Displays pending, completed, and failed counts.
    Status,

    /// List queued mutations
    List {
        /// Status to show (pending, syncing, completed, failed)
        #[arg(long, short)]
        status: Option<String>,

        /// Maximum number of entries to show
        #[arg(long, short = 'n', default_value = "20")]
        limit: usize,
    },

    /// Requeue failed mutations
    ///
    /// The mutation keeps its idempotency key and goes to the back of the
    /// queue with a fresh retry budget.
    Retry {
        /// Requeue every failed mutation
        #[arg(long, conflicts_with = "id")]
        all: bool,

        /// Failed mutation to requeue
        id: Option<ItemId>,
    },

    /// Discard a failed mutation
    Dismiss {
        /// Failed mutation to discard
        id: ItemId,
    },

    /// Withdraw a mutation that has not started syncing
    Cancel {
        /// Pending mutation to withdraw
        id: ItemId,
    },

    /// Remove completed and failed entries past their retention age
    Clear,

    /// Return mutations left mid-sync by a crash to pending
    ///
    /// Only run this while the app is closed.
    Recover,
}
