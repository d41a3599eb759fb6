//! Connectivity observation.
//!
//! The host feeds platform reachability into a [`NetworkMonitor`]. A
//! [`ConnectivityWatcher`] drains the queue each time the device goes from
//! offline to online.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::engine::SyncEngine;

/// Reachability as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    /// A network interface is up.
    pub is_connected: bool,
    /// The internet is reachable. `None` while the platform has not decided.
    pub is_internet_reachable: Option<bool>,
}

impl NetworkState {
    /// Connected with reachability confirmed.
    #[must_use]
    pub const fn online() -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: Some(true),
        }
    }

    /// No connection.
    #[must_use]
    pub const fn offline() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: Some(false),
        }
    }

    /// Online unless disconnected or explicitly unreachable.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable != Some(false)
    }
}

impl Default for NetworkState {
    fn default() -> Self {
        Self::online()
    }
}

/// Source of connectivity changes.
pub trait NetworkMonitor: Send + Sync {
    /// Receiver that always holds the current state.
    fn watch(&self) -> watch::Receiver<NetworkState>;
}

/// [`NetworkMonitor`] driven by explicit [`set`](Self::set) calls.
#[derive(Debug)]
pub struct WatchMonitor {
    tx: watch::Sender<NetworkState>,
}

impl WatchMonitor {
    /// Create a monitor with an initial state.
    #[must_use]
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Report a new state.
    pub fn set(&self, state: NetworkState) {
        self.tx.send_replace(state);
    }

    /// The last reported state.
    #[must_use]
    pub fn current(&self) -> NetworkState {
        *self.tx.borrow()
    }
}

impl Default for WatchMonitor {
    fn default() -> Self {
        Self::new(NetworkState::online())
    }
}

impl NetworkMonitor for WatchMonitor {
    fn watch(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}

/// Background task that drains on every offline to online transition.
///
/// The task stops when the watcher is dropped.
pub struct ConnectivityWatcher {
    handle: JoinHandle<()>,
    drains: Arc<AtomicUsize>,
}

impl ConnectivityWatcher {
    /// Start watching. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(engine: SyncEngine, monitor: &dyn NetworkMonitor) -> Self {
        let mut rx = monitor.watch();
        let drains = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&drains);
        let mut was_online = rx.borrow_and_update().is_online();

        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = rx.borrow_and_update().is_online();
                if online && !was_online {
                    info!("Network back online, draining sync queue");
                    counter.fetch_add(1, Ordering::SeqCst);
                    let report = engine.drain().await;
                    debug!(?report, "Reconnect drain finished");
                } else if !online && was_online {
                    info!("Network offline, queueing mutations");
                }
                was_online = online;
            }
        });

        Self { handle, drains }
    }

    /// Number of drains this watcher has started.
    #[must_use]
    pub fn drains_triggered(&self) -> usize {
        self.drains.load(Ordering::SeqCst)
    }

    /// Stop watching.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for ConnectivityWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_rules() {
        assert!(NetworkState::online().is_online());
        assert!(!NetworkState::offline().is_online());
        assert!(NetworkState {
            is_connected: true,
            is_internet_reachable: None,
        }
        .is_online());
        assert!(!NetworkState {
            is_connected: true,
            is_internet_reachable: Some(false),
        }
        .is_online());
        assert!(!NetworkState {
            is_connected: false,
            is_internet_reachable: Some(true),
        }
        .is_online());
    }

    #[test]
    fn test_watch_monitor_reports_latest_state() {
        let monitor = WatchMonitor::new(NetworkState::offline());
        let rx = monitor.watch();
        assert!(!rx.borrow().is_online());

        monitor.set(NetworkState::online());
        assert!(rx.borrow().is_online());
        assert_eq!(monitor.current(), NetworkState::online());
    }
}
