//! Sync engine
//!
//! Wires the pipeline together and owns its background tasks:
//!
//! ```text
//!                ┌──────────────────┐  status   ┌──────────────┐
//!  transport ───▶│ ConnectionMonitor├──────────▶│ flush trigger├──▶ QueueProcessor
//!  host      ───▶└──────────────────┘           └──────────────┘         │
//!                                                                         ▼
//!  DiningMutation ──(offline)──▶ MutationQueue ◀──────────── replay ── backend
//!        │                                                                │
//!        └──────(online)──────────────────────────────────────────────────┘
//!  RealtimeSync ──▶ DashboardCache refetch (skips in-flight members)
//! ```

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::backend::{HealthMonitor, PocketBaseRealtime, RecordBackend};
use crate::cache::{DashboardCache, DashboardQuery};
use crate::connection::{ConnectionMonitor, ConnectionStore, MonitorHandle};
use crate::events::ClientEvent;
use crate::mutation::DiningMutation;
use crate::queue::{MutationQueue, QueueProcessor, QueueProjection};
use crate::realtime::{RealtimeHandle, RealtimeSync};
use crate::repository::DiningRepository;
use crate::transport::{HostNetwork, RealtimeTransport};
use crate::view::{DashboardRow, overlay_rows};
use crate::{ClientConfig, ClientResult};

/// Running offline-resilient client
#[derive(Debug)]
pub struct SyncEngine {
    connection: ConnectionStore,
    projection: QueueProjection,
    cache: DashboardCache,
    dashboard: DashboardQuery,
    repository: DiningRepository,
    processor: QueueProcessor,
    monitor: Option<MonitorHandle>,
    realtime: Option<RealtimeHandle>,
    flush_trigger: Option<JoinHandle<()>>,
}

impl SyncEngine {
    /// Start against the PocketBase server described by `config`: REST
    /// backend, realtime stream and health-endpoint reachability.
    pub async fn connect(config: &ClientConfig) -> ClientResult<Self> {
        let backend = Arc::new(config.build_backend()?);
        let transport = Arc::new(PocketBaseRealtime::new(config)?);
        let host = Arc::new(HealthMonitor::start(config)?);
        Self::start(config, backend, transport, host).await
    }

    /// Open the durable queue under the work directory and start
    pub async fn start(
        config: &ClientConfig,
        backend: Arc<dyn RecordBackend>,
        transport: Arc<dyn RealtimeTransport>,
        host: Arc<dyn HostNetwork>,
    ) -> ClientResult<Self> {
        let queue = MutationQueue::open(config.queue_path())?;
        Self::start_with_queue(queue, backend, transport, host).await
    }

    pub async fn start_with_queue(
        queue: MutationQueue,
        backend: Arc<dyn RecordBackend>,
        transport: Arc<dyn RealtimeTransport>,
        host: Arc<dyn HostNetwork>,
    ) -> ClientResult<Self> {
        let connection = ConnectionStore::new();
        let projection = QueueProjection::new();
        let cache = DashboardCache::new();
        let repository = DiningRepository::new(backend);
        let dashboard = DashboardQuery::new(cache.clone(), repository.clone());

        let processor = QueueProcessor::new(
            queue,
            projection.clone(),
            repository.clone(),
            dashboard.clone(),
            connection.clone(),
            host.clone(),
        );

        // Queued edits from a previous session show up immediately
        processor.refresh_projection()?;
        let queued = projection.queued_mutations().len();

        // Subscribe before the monitor can publish the first transition
        let flush_trigger = processor.spawn_flush_trigger();

        let monitor = ConnectionMonitor::new(connection.clone(), transport.clone(), host)
            .start()
            .await;
        let realtime = RealtimeSync::new(
            transport,
            connection.clone(),
            projection.clone(),
            dashboard.clone(),
        )
        .start()
        .await;

        tracing::info!(queued, "Sync engine started");

        Ok(Self {
            connection,
            projection,
            cache,
            dashboard,
            repository,
            processor,
            monitor: Some(monitor),
            realtime: Some(realtime),
            flush_trigger: Some(flush_trigger),
        })
    }

    /// Toggle handle for one lodge's dashboard
    pub fn mutation(&self, lodge_id: impl Into<String>) -> DiningMutation {
        DiningMutation::new(
            lodge_id,
            self.cache.clone(),
            self.repository.clone(),
            self.processor.clone(),
            self.connection.clone(),
        )
    }

    /// Cached rows for the lodge with queued intents and indicators applied
    pub fn dashboard_view(&self, mutation: &DiningMutation) -> Vec<DashboardRow> {
        let rows = self.cache.rows(mutation.lodge_id()).unwrap_or_default();
        overlay_rows(
            &rows,
            &self.projection.snapshot(),
            &mutation.pending().snapshot(),
        )
    }

    pub fn dashboard(&self) -> &DashboardQuery {
        &self.dashboard
    }

    pub fn repository(&self) -> &DiningRepository {
        &self.repository
    }

    pub fn connection(&self) -> &ConnectionStore {
        &self.connection
    }

    pub fn projection(&self) -> &QueueProjection {
        &self.projection
    }

    pub fn processor(&self) -> &QueueProcessor {
        &self.processor
    }

    /// "Synced N changes" notifications
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.processor.subscribe_events()
    }

    /// Stop every background task and release every subscription
    pub async fn shutdown(mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.shutdown().await;
        }
        if let Some(realtime) = self.realtime.take() {
            realtime.shutdown().await;
        }

        self.processor.stop();
        if let Some(trigger) = self.flush_trigger.take()
            && let Err(e) = trigger.await
        {
            tracing::warn!(error = %e, "Flush trigger ended abnormally");
        }

        tracing::info!("Sync engine stopped");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.processor.stop();
    }
}
