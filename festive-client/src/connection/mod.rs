//! Connectivity state
//!
//! [`ConnectionStore`] owns the process-wide [`ConnectionStatus`];
//! [`ConnectionMonitor`] is the only writer in normal operation.

mod monitor;

pub use monitor::{
    ConnectionMonitor, DISCONNECT_DEBOUNCE, MonitorHandle, RECONNECT_POLL_INTERVAL,
    RECONNECT_POLL_MAX,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

/// Capacity of the transition channel
const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Tri-state connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    /// Initial state until the first signal arrives
    #[default]
    Offline,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// One status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
    pub at: Instant,
}

impl StatusTransition {
    /// Entered `connected` from any other state
    pub fn is_reconnect(&self) -> bool {
        self.to == ConnectionStatus::Connected && self.from != ConnectionStatus::Connected
    }
}

struct ConnectionInner {
    status: watch::Sender<ConnectionStatus>,
    transitions: broadcast::Sender<StatusTransition>,
    last_synced_at: Mutex<Option<DateTime<Utc>>>,
    realtime_connected: AtomicBool,
}

/// Process-wide connectivity store. Cloning shares the same state.
#[derive(Clone)]
pub struct ConnectionStore {
    inner: Arc<ConnectionInner>,
}

impl ConnectionStore {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ConnectionInner {
                status,
                transitions,
                last_synced_at: Mutex::new(None),
                realtime_connected: AtomicBool::new(false),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Set the status; a no-op when unchanged (no transition is published)
    pub fn set_status(&self, next: ConnectionStatus) {
        let mut previous = None;
        self.inner.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            previous = Some(*current);
            *current = next;
            true
        });

        if let Some(from) = previous {
            tracing::info!(%from, to = %next, "Connection status changed");
            let _ = self.inner.transitions.send(StatusTransition {
                from,
                to: next,
                at: Instant::now(),
            });
        }
    }

    /// Latest status, for renderers
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Every transition, in order
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StatusTransition> {
        self.inner.transitions.subscribe()
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_synced_at.lock()
    }

    pub fn set_last_synced_at(&self, at: DateTime<Utc>) {
        *self.inner.last_synced_at.lock() = Some(at);
    }

    /// "Last synced 2 minutes ago" style label
    pub fn last_synced_label(&self) -> Option<String> {
        self.last_synced_at()
            .map(|at| shared::util::format_time_ago(at, Utc::now()))
    }

    pub fn is_realtime_connected(&self) -> bool {
        self.inner.realtime_connected.load(Ordering::SeqCst)
    }

    pub fn set_realtime_connected(&self, connected: bool) {
        self.inner.realtime_connected.store(connected, Ordering::SeqCst);
    }
}

impl Default for ConnectionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStore")
            .field("status", &self.status())
            .field("last_synced_at", &self.last_synced_at())
            .finish()
    }
}
