//! Server-push invalidation
//!
//! Each record event for `dining_records` refetches the affected lodge's
//! dashboard, except for members whose change is queued or syncing: a push
//! that predates the replay must not overwrite the optimistic row.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::DINING_RECORDS;
use crate::cache::DashboardQuery;
use crate::connection::ConnectionStore;
use crate::queue::QueueProjection;
use crate::transport::{RealtimeTransport, RecordEvent, Subscription};

#[derive(Debug)]
pub struct RealtimeSync {
    transport: Arc<dyn RealtimeTransport>,
    connection: ConnectionStore,
    projection: QueueProjection,
    dashboard: DashboardQuery,
    collection: String,
}

impl RealtimeSync {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        connection: ConnectionStore,
        projection: QueueProjection,
        dashboard: DashboardQuery,
    ) -> Self {
        Self {
            transport,
            connection,
            projection,
            dashboard,
            collection: DINING_RECORDS.to_string(),
        }
    }

    /// Subscribe and spawn the invalidation loop.
    ///
    /// A refused subscription is logged and leaves `realtime_connected` false.
    pub async fn start(self) -> RealtimeHandle {
        let shutdown = CancellationToken::new();

        let events = match self.transport.subscribe_collection(&self.collection).await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(collection = %self.collection, error = %e, "Realtime subscription failed");
                self.connection.set_realtime_connected(false);
                return RealtimeHandle {
                    shutdown,
                    task: None,
                };
            }
        };

        self.connection.set_realtime_connected(true);
        tracing::debug!(collection = %self.collection, "Realtime subscription active");

        let task = tokio::spawn(self.run(events, shutdown.clone()));
        RealtimeHandle {
            shutdown,
            task: Some(task),
        }
    }

    async fn run(self, mut events: Subscription<RecordEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(&event).await,
                    None => {
                        tracing::info!(collection = %self.collection, "Realtime stream closed");
                        break;
                    }
                },
            }
        }
        drop(events);
        self.connection.set_realtime_connected(false);
    }

    async fn handle_event(&self, event: &RecordEvent) {
        tracing::debug!(collection = %self.collection, action = ?event.action, "Realtime event");

        if let Some(member_id) = event.field("member_id")
            && self.projection.is_in_flight(member_id)
        {
            tracing::debug!(member_id, "Skipping invalidation for member with queued change");
            return;
        }

        match event.field("lodge_id") {
            Some(lodge_id) => self.dashboard.invalidate(lodge_id).await,
            None => self.dashboard.invalidate_all().await,
        }
    }
}

/// Running invalidation loop
#[derive(Debug)]
pub struct RealtimeHandle {
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RealtimeHandle {
    /// Whether the subscription was established
    pub fn is_active(&self) -> bool {
        self.task.is_some()
    }

    /// Unsubscribe and wait for the loop to end
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "Realtime task ended abnormally");
        }
    }
}

impl Drop for RealtimeHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
