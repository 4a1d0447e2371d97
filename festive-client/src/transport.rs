//! Signal sources the client listens to
//!
//! Two independent layers report connectivity:
//!
//! - [`RealtimeTransport`]: the backend's push stream. Authoritative, but it
//!   may give up reconnecting while the host is offline and then never
//!   report the recovery on its own.
//! - [`HostNetwork`]: coarse host-level online/offline events.
//!
//! Every listener is a [`Subscription`]; dropping it releases the listener.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ClientResult;

/// Live listener on a signal source
///
/// Dropping the subscription runs its release hook exactly once.
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl<T: Clone> Subscription<T> {
    pub fn new(rx: broadcast::Receiver<T>) -> Self {
        Self { rx, release: None }
    }

    /// Attach a hook that runs when the subscription is dropped
    pub fn with_release(rx: broadcast::Receiver<T>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            release: Some(Box::new(release)),
        }
    }

    /// Next event, or `None` once the source is gone.
    ///
    /// A slow listener skips what it missed instead of failing.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Subscription lagged, skipping missed events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Release the listener now
    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

/// Push stream dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    /// Topics that were subscribed when the stream dropped
    pub active_subscriptions: Vec<String>,
}

/// Host-level network event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Online,
    Offline,
}

/// Kind of change carried by a push event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordAction {
    Create,
    Update,
    Delete,
}

/// Server-pushed change to one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEvent {
    pub action: RecordAction,
    pub record: serde_json::Value,
}

impl RecordEvent {
    pub fn new(action: RecordAction, record: serde_json::Value) -> Self {
        Self { action, record }
    }

    /// String field of the pushed record
    pub fn field(&self, name: &str) -> Option<&str> {
        self.record.get(name).and_then(|v| v.as_str())
    }
}

/// Backend push stream (realtime subscriptions)
#[async_trait]
pub trait RealtimeTransport: Send + Sync + std::fmt::Debug {
    /// Whether the push stream is currently up
    fn is_connected(&self) -> bool;

    /// Stream-dropped notifications
    fn on_disconnect(&self) -> Subscription<DisconnectEvent>;

    /// Fires every time the stream (re)connects
    async fn subscribe_connect(&self) -> ClientResult<Subscription<()>>;

    /// Record change events for one collection
    async fn subscribe_collection(&self, collection: &str)
    -> ClientResult<Subscription<RecordEvent>>;
}

/// Host network reachability
pub trait HostNetwork: Send + Sync + std::fmt::Debug {
    fn is_online(&self) -> bool;

    fn subscribe(&self) -> Subscription<HostEvent>;
}

/// Resolves once the host reports offline; never resolves if the source closes.
pub(crate) async fn wait_for_offline(events: &mut Subscription<HostEvent>) {
    loop {
        match events.recv().await {
            Some(HostEvent::Offline) => return,
            Some(HostEvent::Online) => continue,
            None => std::future::pending::<()>().await,
        }
    }
}
