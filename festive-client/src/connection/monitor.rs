//! Connection monitor
//!
//! Fuses the push-stream lifecycle and host online/offline events into one
//! debounced [`ConnectionStatus`]:
//!
//! ```text
//!   connect signal ─────────────▶ connected
//!   disconnect / host offline ──▶ reconnecting ──(2s)──▶ offline
//!   host online ────────────────▶ reconnecting ──poll──▶ connected | offline (30s)
//! ```
//!
//! Both timers are deadlines owned by the monitor task, so shutting the task
//! down drops them together with every subscription.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ConnectionStatus, ConnectionStore};
use crate::transport::{HostEvent, HostNetwork, RealtimeTransport, Subscription};

/// Delay before `reconnecting` becomes `offline`
pub const DISCONNECT_DEBOUNCE: Duration = Duration::from_millis(2000);

/// How often the transport's own connected flag is checked after the host comes back
pub const RECONNECT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Give up polling after this long and fall back to `offline`
pub const RECONNECT_POLL_MAX: Duration = Duration::from_millis(30_000);

/// Idle wake-up for the select loop when no timer is armed
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// Fuses transport and host signals into the connection store
#[derive(Debug)]
pub struct ConnectionMonitor {
    store: ConnectionStore,
    transport: Arc<dyn RealtimeTransport>,
    host: Arc<dyn HostNetwork>,
}

impl ConnectionMonitor {
    pub fn new(
        store: ConnectionStore,
        transport: Arc<dyn RealtimeTransport>,
        host: Arc<dyn HostNetwork>,
    ) -> Self {
        Self {
            store,
            transport,
            host,
        }
    }

    /// Subscribe to every signal source and spawn the monitor task
    ///
    /// Failing to subscribe to the connect signal leaves the client `offline`;
    /// host events and the reconnect poll can still recover it.
    pub async fn start(self) -> MonitorHandle {
        let disconnects = self.transport.on_disconnect();

        let connects = match self.transport.subscribe_connect().await {
            Ok(sub) => Some(sub),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to subscribe to connect signal, marking offline");
                self.store.set_status(ConnectionStatus::Offline);
                None
            }
        };

        let host_events = self.host.subscribe();
        let shutdown = CancellationToken::new();

        let signals = Signals {
            disconnects,
            connects,
            host_events,
        };
        let state = MonitorState::new(self.store, self.transport);
        let task = tokio::spawn(run(state, signals, shutdown.clone()));

        tracing::debug!("Connection monitor started");
        MonitorHandle {
            shutdown,
            task: Some(task),
        }
    }
}

/// Running monitor. Dropping it cancels the task; `shutdown` also waits for it.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stop the monitor and wait until every timer and subscription is released
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "Connection monitor task ended abnormally");
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Subscriptions owned by the monitor task
struct Signals {
    disconnects: Subscription<crate::transport::DisconnectEvent>,
    connects: Option<Subscription<()>>,
    host_events: Subscription<HostEvent>,
}

#[derive(Debug, Clone, Copy)]
struct ReconnectPoll {
    next_tick: Instant,
    deadline: Instant,
}

struct MonitorState {
    store: ConnectionStore,
    transport: Arc<dyn RealtimeTransport>,
    debounce_deadline: Option<Instant>,
    poll: Option<ReconnectPoll>,
}

impl MonitorState {
    fn new(store: ConnectionStore, transport: Arc<dyn RealtimeTransport>) -> Self {
        Self {
            store,
            transport,
            debounce_deadline: None,
            poll: None,
        }
    }

    fn mark_connected(&mut self) {
        self.debounce_deadline = None;
        self.stop_reconnect_poll();
        self.store.set_status(ConnectionStatus::Connected);
        self.store.set_last_synced_at(Utc::now());
    }

    /// Idempotent while a debounce is pending
    fn mark_disconnected_debounced(&mut self) {
        if self.debounce_deadline.is_some() {
            return;
        }
        self.store.set_status(ConnectionStatus::Reconnecting);
        self.debounce_deadline = Some(Instant::now() + DISCONNECT_DEBOUNCE);
    }

    fn on_debounce_elapsed(&mut self) {
        self.debounce_deadline = None;
        self.store.set_status(ConnectionStatus::Offline);
    }

    fn start_reconnect_poll(&mut self) {
        let now = Instant::now();
        self.poll = Some(ReconnectPoll {
            next_tick: now + RECONNECT_POLL_INTERVAL,
            deadline: now + RECONNECT_POLL_MAX,
        });
    }

    fn stop_reconnect_poll(&mut self) {
        self.poll = None;
    }

    fn on_poll_tick(&mut self) {
        let Some(mut poll) = self.poll else {
            return;
        };

        if self.transport.is_connected() {
            tracing::debug!("Reconnect poll found transport connected");
            self.mark_connected();
            return;
        }

        let now = Instant::now();
        if now >= poll.deadline {
            tracing::info!("Reconnect poll window exhausted, marking offline");
            self.stop_reconnect_poll();
            self.store.set_status(ConnectionStatus::Offline);
            return;
        }

        poll.next_tick += RECONNECT_POLL_INTERVAL;
        self.poll = Some(poll);
    }

    fn on_host_online(&mut self) {
        if self.store.status() != ConnectionStatus::Connected {
            self.store.set_status(ConnectionStatus::Reconnecting);
            self.start_reconnect_poll();
        }
    }

    fn on_host_offline(&mut self) {
        self.stop_reconnect_poll();
        self.mark_disconnected_debounced();
    }
}

async fn recv_connect(connects: &mut Option<Subscription<()>>) -> Option<()> {
    match connects {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn run(mut state: MonitorState, mut signals: Signals, shutdown: CancellationToken) {
    let mut disconnects_open = true;
    let mut connects_open = signals.connects.is_some();
    let mut host_open = true;

    loop {
        let idle = Instant::now() + IDLE_SLEEP;
        let debounce_at = state.debounce_deadline.unwrap_or(idle);
        let poll_at = state.poll.map(|p| p.next_tick).unwrap_or(idle);

        tokio::select! {
            _ = shutdown.cancelled() => break,

            // Debounce elapsed without a connect signal
            _ = tokio::time::sleep_until(debounce_at), if state.debounce_deadline.is_some() => {
                state.on_debounce_elapsed();
            }

            _ = tokio::time::sleep_until(poll_at), if state.poll.is_some() => {
                state.on_poll_tick();
            }

            event = signals.disconnects.recv(), if disconnects_open => match event {
                // A drop with nothing subscribed is an idle close, not an outage
                Some(event) if !event.active_subscriptions.is_empty() => {
                    state.mark_disconnected_debounced();
                }
                Some(_) => {}
                None => disconnects_open = false,
            },

            event = recv_connect(&mut signals.connects), if connects_open => match event {
                Some(()) => state.mark_connected(),
                None => connects_open = false,
            },

            event = signals.host_events.recv(), if host_open => match event {
                Some(HostEvent::Online) => state.on_host_online(),
                Some(HostEvent::Offline) => state.on_host_offline(),
                None => host_open = false,
            },
        }
    }

    drop(signals);
    tracing::debug!("Connection monitor stopped");
}
