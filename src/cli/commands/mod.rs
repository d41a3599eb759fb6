//! Command implementations for studysync.

mod completions;
mod sync;

pub use completions::completions;
pub use sync::{open_store, sync};
