//! Offline mutation queue.
//!
//! Mutations made while offline are persisted and delivered in order once the
//! backend is reachable again.
//!
//! Features:
//! - Durable queue that survives restarts
//! - Per-class retry with exponential backoff and jitter
//! - Per-entity ordering and prerequisite items
//! - Coalesced queue statistics for UI subscribers
//! - Automatic drain on reconnect

pub mod engine;
pub mod mutation;
pub mod network;
pub mod publisher;
pub mod queue;
pub mod remote;
pub mod retry;

pub use engine::{Collaborators, DeliveryResult, DrainReport, ItemOutcome, SyncEngine};
pub use mutation::{
    BatchFailure, BatchMember, BatchOperation, BatchPayload, BatchResults, ItemError, ItemId,
    ItemStatus, ItemTable, Mutation, NewItem, QueueItem,
};
pub use network::{ConnectivityWatcher, NetworkMonitor, NetworkState, WatchMonitor};
pub use publisher::{QueueStats, StatsPublisher, Subscription};
pub use queue::{ItemPatch, PruneReport, QueueStore, StatusCounts};
pub use remote::{
    CacheInvalidator, ErrorKind, InvokeError, InvokeRequest, NoopCache, RemoteInvoker,
    SessionProvider, StaticSession,
};
pub use retry::{OperationClass, RetryPolicy};
