//! Queue flush
//!
//! Replays the durable queue oldest-first when the client reconnects:
//!
//! ```text
//! for each queued mutation (re-read from the store, in key order):
//!   add_syncing ─▶ write ─┬─ ok ──▶ remove row ─┬─ removed ──▶ patch cache ─▶ remove_queued
//!                         │                     └─ replaced ─▶ keep record id only
//!                         ├─ host offline ─────────────────────────▶ stop
//!                         └─ rejected ─▶ backoff retries ─┬─ ok ─▶ (as above)
//!                                                         ├─ replaced ─▶ next entry
//!                                                         └─ exhausted / offline ─▶ stop
//!   remove_syncing
//! then: rebuild projection, notify, refetch (only while connected)
//! ```
//!
//! A stop leaves that entry and every later one queued for the next reconnect.
//! An edit queued while the flush runs replaces the member's row and gets a
//! higher key, so the same flush replays it after the older entries.

use shared::models::{DiningEntry, MemberEntry};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::projection::QueueProjection;
use super::store::{MutationQueue, NewMutation, QueuedMutation};
use crate::cache::DashboardQuery;
use crate::connection::ConnectionStore;
use crate::events::ClientEvent;
use crate::repository::DiningRepository;
use crate::transport::{HostNetwork, wait_for_offline};
use crate::{ClientError, ClientResult};

/// Wait before the first retry
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(1000);
/// Cap on the doubling retry wait
pub const MAX_RETRY_DELAY: Duration = Duration::from_millis(30_000);
/// Retries after the initial replay attempt
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Doubling delays, capped, for a fixed number of retries
#[derive(Debug, Clone)]
struct Backoff {
    next: Duration,
    remaining: u32,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: INITIAL_RETRY_DELAY,
            remaining: MAX_RETRY_ATTEMPTS,
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_RETRY_DELAY);
        Some(delay)
    }
}

/// Per-entry result of a replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOutcome {
    Synced,
    /// A newer edit for the member replaced the entry mid-replay
    Superseded,
    /// Halt this flush; the entry stays queued
    Stop,
}

/// Result of the backoff retries for one entry
enum Retry {
    Delivered(DiningEntry),
    Superseded,
    GaveUp,
}

/// Result of one `process_queue` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    /// Entries still queued afterwards
    pub remaining: usize,
    /// Another flush was already running
    pub skipped: bool,
}

/// Resets the re-entrancy flag when the flush ends
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Orchestrates the durable queue and its replay
#[derive(Debug, Clone)]
pub struct QueueProcessor {
    queue: MutationQueue,
    projection: QueueProjection,
    repository: DiningRepository,
    dashboard: DashboardQuery,
    connection: ConnectionStore,
    host: Arc<dyn HostNetwork>,
    events: broadcast::Sender<ClientEvent>,
    processing: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl QueueProcessor {
    pub fn new(
        queue: MutationQueue,
        projection: QueueProjection,
        repository: DiningRepository,
        dashboard: DashboardQuery,
        connection: ConnectionStore,
        host: Arc<dyn HostNetwork>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            queue,
            projection,
            repository,
            dashboard,
            connection,
            host,
            events,
            processing: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn projection(&self) -> &QueueProjection {
        &self.projection
    }

    /// Flush notifications
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Rebuild the projection from the durable queue
    pub fn refresh_projection(&self) -> ClientResult<()> {
        let ids = self.queue.get_queued_member_ids()?;
        let mutations = self.queue.get_all()?;
        self.projection.set_queued_state(ids, mutations);
        Ok(())
    }

    /// Persist a deferred edit, replacing any queued edit for the same member
    pub fn enqueue(&self, mutation: NewMutation) -> ClientResult<QueuedMutation> {
        MemberEntry::new(mutation.member_id.as_str(), mutation.new_status)
            .validate()
            .map_err(ClientError::Validation)?;

        let queued = self.queue.enqueue(mutation)?;
        tracing::info!(
            member_id = %queued.member_id,
            lodge_id = %queued.lodge_id,
            status = %queued.new_status,
            "Dining change queued for later sync"
        );
        self.refresh_projection()?;
        Ok(queued)
    }

    /// Replay every queued mutation, oldest first.
    ///
    /// A call while another flush runs returns immediately with `skipped`.
    pub async fn process_queue(&self) -> ClientResult<SyncReport> {
        if self.processing.swap(true, Ordering::SeqCst) {
            tracing::debug!("Queue flush already running");
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        }
        let _guard = ProcessingGuard(&self.processing);

        let drained = self.drain().await;

        if let Ok(synced) = &drained
            && *synced > 0
        {
            tracing::info!(synced, "Queue flushed");
            let _ = self.events.send(ClientEvent::QueueSynced { count: *synced });
        }

        // Whatever happened above, unprocessed entries must reappear
        let refreshed = self.refresh_projection();

        // Refetching while offline would replace good rows with an error
        if self.connection.is_connected() {
            self.dashboard.invalidate_all().await;
        } else {
            tracing::debug!("Connection lost during flush, skipping dashboard refetch");
        }

        let synced = drained?;
        refreshed?;

        Ok(SyncReport {
            synced,
            remaining: self.projection.queued_mutations().len(),
            skipped: false,
        })
    }

    async fn drain(&self) -> ClientResult<usize> {
        let pending = self.queue.len()?;
        if pending == 0 {
            return Ok(0);
        }
        tracing::info!(count = pending, "Replaying queued dining changes");

        let mut synced = 0;
        let mut cursor = None;
        while let Some(mutation) = self.queue.next_after(cursor)? {
            if self.shutdown.is_cancelled() {
                break;
            }
            cursor = Some(mutation.id);
            match self.sync_one(&mutation).await? {
                SyncOutcome::Synced => synced += 1,
                SyncOutcome::Superseded => {}
                SyncOutcome::Stop => break,
            }
        }
        Ok(synced)
    }

    async fn sync_one(&self, mutation: &QueuedMutation) -> ClientResult<SyncOutcome> {
        self.projection.add_syncing(&mutation.member_id);
        let outcome = self.deliver(mutation).await;
        self.projection.remove_syncing(&mutation.member_id);
        outcome
    }

    async fn deliver(&self, mutation: &QueuedMutation) -> ClientResult<SyncOutcome> {
        let entry = match self.repository.replay(mutation).await {
            Ok(entry) => entry,
            Err(e) if !self.host.is_online() => {
                tracing::info!(member_id = %mutation.member_id, error = %e, "Host offline, pausing queue flush");
                return Ok(SyncOutcome::Stop);
            }
            Err(e) => {
                tracing::warn!(member_id = %mutation.member_id, error = %e, "Replay failed, retrying with backoff");
                match self.retry_with_backoff(mutation).await? {
                    Retry::Delivered(entry) => entry,
                    Retry::Superseded => return Ok(SyncOutcome::Superseded),
                    Retry::GaveUp => return Ok(SyncOutcome::Stop),
                }
            }
        };

        if !self.queue.remove(mutation.id)? {
            // The member's newer edit is still queued; only the record id is news
            self.queue.adopt_record_id(&mutation.member_id, &entry.id)?;
            self.dashboard
                .cache()
                .remember_record_id(&mutation.lodge_id, &mutation.member_id, &entry.id);
            tracing::debug!(member_id = %mutation.member_id, record_id = %entry.id, "Queued change superseded while syncing");
            return Ok(SyncOutcome::Superseded);
        }

        // Patch before dropping the overlay so the row never shows stale data
        self.dashboard.cache().patch_member(
            &mutation.lodge_id,
            &mutation.member_id,
            mutation.new_status,
            Some(&entry.id),
        );
        self.projection.remove_queued(&mutation.member_id);

        tracing::debug!(member_id = %mutation.member_id, record_id = %entry.id, "Queued change synced");
        Ok(SyncOutcome::Synced)
    }

    async fn retry_with_backoff(&self, mutation: &QueuedMutation) -> ClientResult<Retry> {
        let mut host_events = self.host.subscribe();

        for (attempt, delay) in Backoff::new().enumerate() {
            tracing::debug!(
                member_id = %mutation.member_id,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Waiting before replay retry"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_offline(&mut host_events) => {
                    tracing::info!(member_id = %mutation.member_id, "Host went offline during backoff");
                    return Ok(Retry::GaveUp);
                }
                _ = self.shutdown.cancelled() => return Ok(Retry::GaveUp),
            }

            if !self.host.is_online() {
                return Ok(Retry::GaveUp);
            }
            if self.queue.get(mutation.id)?.is_none() {
                tracing::debug!(member_id = %mutation.member_id, "Queued change replaced during backoff");
                return Ok(Retry::Superseded);
            }

            match self.repository.replay(mutation).await {
                Ok(entry) => return Ok(Retry::Delivered(entry)),
                Err(e) => {
                    tracing::warn!(member_id = %mutation.member_id, attempt = attempt + 1, error = %e, "Replay retry failed");
                }
            }
        }

        tracing::warn!(member_id = %mutation.member_id, "Replay retries exhausted, leaving change queued");
        Ok(Retry::GaveUp)
    }

    /// Flush the queue every time the connection store enters `connected`
    pub fn spawn_flush_trigger(&self) -> JoinHandle<()> {
        let processor = self.clone();
        let mut transitions = self.connection.subscribe_transitions();

        tokio::spawn(async move {
            loop {
                let reconnected = tokio::select! {
                    _ = processor.shutdown.cancelled() => break,
                    event = transitions.recv() => match event {
                        Ok(transition) => transition.is_reconnect(),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Flush trigger lagged behind status changes");
                            processor.connection.is_connected()
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                if reconnected && let Err(e) = processor.process_queue().await {
                    tracing::error!(error = %e, "Queue flush failed");
                }
            }
            tracing::debug!("Flush trigger stopped");
        })
    }

    /// Stop the trigger loop and abort any backoff wait
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DINING_RECORDS, MEMBERS};
    use crate::cache::DashboardCache;
    use crate::connection::ConnectionStatus;
    use crate::memory::{Failure, InMemoryBackend, ManualHost};
    use serde_json::json;
    use shared::models::DiningStatus;
    use tokio::time::Instant;

    const LODGE: &str = "lodge_001";

    struct Fixture {
        backend: Arc<InMemoryBackend>,
        host: Arc<ManualHost>,
        connection: ConnectionStore,
        cache: DashboardCache,
        processor: QueueProcessor,
    }

    async fn fixture() -> Fixture {
        let backend = Arc::new(InMemoryBackend::new());
        for (id, last) in [("mem_001", "Ashmole"), ("mem_002", "Byrom"), ("mem_003", "Moray")] {
            backend.insert(
                MEMBERS,
                json!({
                    "id": id, "lodge_id": LODGE, "first_name": "Bro",
                    "last_name": last, "rank": "", "status": "active"
                }),
            );
        }
        backend.insert(
            DINING_RECORDS,
            json!({
                "id": "din_001", "lodge_id": LODGE, "member_id": "mem_001",
                "meeting_date": "2026-02-14T19:00:00.000Z", "status": "not_dining",
                "updated_by": "secretary"
            }),
        );

        let host = Arc::new(ManualHost::new(true));
        let connection = ConnectionStore::new();
        connection.set_status(ConnectionStatus::Connected);

        let repository = DiningRepository::new(backend.clone());
        let cache = DashboardCache::new();
        let dashboard = DashboardQuery::new(cache.clone(), repository.clone());
        dashboard.fetch(LODGE).await.unwrap();

        let processor = QueueProcessor::new(
            MutationQueue::open_in_memory().unwrap(),
            QueueProjection::new(),
            repository,
            dashboard,
            connection.clone(),
            host.clone(),
        );

        Fixture {
            backend,
            host,
            connection,
            cache,
            processor,
        }
    }

    fn queue_change(fx: &Fixture, member_id: &str, record_id: Option<&str>, status: DiningStatus) {
        fx.processor
            .enqueue(NewMutation::new(
                LODGE,
                member_id,
                record_id.map(str::to_string),
                status,
            ))
            .unwrap();
    }

    #[test]
    fn test_backoff_sequence() {
        let delays: Vec<u64> = Backoff::new().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, [1000, 2000, 4000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replays_fifo_and_patches_cache() {
        let fx = fixture().await;
        let mut events = fx.processor.subscribe_events();

        queue_change(&fx, "mem_001", Some("din_001"), DiningStatus::Dining);
        queue_change(&fx, "mem_002", None, DiningStatus::Dining);
        queue_change(&fx, "mem_003", None, DiningStatus::NotDining);
        assert_eq!(fx.processor.projection().queued_member_ids().len(), 3);

        let report = fx.processor.process_queue().await.unwrap();
        assert_eq!(report.synced, 3);
        assert_eq!(report.remaining, 0);

        let writes = fx.backend.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0].id.as_deref(), Some("din_001"));
        assert_eq!(writes[1].fields["member_id"], "mem_002");
        assert_eq!(writes[2].fields["member_id"], "mem_003");

        let state = fx.processor.projection().snapshot();
        assert!(state.queued_member_ids.is_empty());
        assert!(state.syncing_member_ids.is_empty());

        let row = fx.cache.member_row(LODGE, "mem_002").unwrap();
        assert_eq!(row.status, DiningStatus::Dining);
        assert!(row.dining_record_id.is_some());

        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::QueueSynced { count: 3 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_then_left_queued() {
        let fx = fixture().await;
        let mut events = fx.processor.subscribe_events();
        fx.backend.fail_next_writes(10, Failure::Server(500));

        queue_change(&fx, "mem_001", Some("din_001"), DiningStatus::Dining);
        queue_change(&fx, "mem_002", None, DiningStatus::Dining);

        let report = fx.processor.process_queue().await.unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.remaining, 2);

        let writes = fx.backend.writes();
        assert_eq!(writes.len(), 1 + MAX_RETRY_ATTEMPTS as usize);
        let gaps: Vec<u64> = writes
            .windows(2)
            .map(|w| (w[1].at - w[0].at).as_millis() as u64)
            .collect();
        assert_eq!(gaps, [1000, 2000, 4000]);
        // The later entry was never attempted
        assert!(writes.iter().all(|w| w.id.as_deref() == Some("din_001")));

        let state = fx.processor.projection().snapshot();
        assert!(state.is_queued("mem_001"));
        assert!(!state.is_syncing("mem_001"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_within_backoff() {
        let fx = fixture().await;
        fx.backend.fail_next_writes(2, Failure::Server(503));
        queue_change(&fx, "mem_001", Some("din_001"), DiningStatus::Dining);

        let start = Instant::now();
        let report = fx.processor.process_queue().await.unwrap();

        assert_eq!(report.synced, 1);
        assert_eq!(fx.backend.write_count(), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_failure_stops_without_retry() {
        let fx = fixture().await;
        fx.backend.fail_next_writes(1, Failure::Network);
        fx.host.go_offline();

        queue_change(&fx, "mem_001", Some("din_001"), DiningStatus::Dining);
        queue_change(&fx, "mem_002", None, DiningStatus::Dining);

        let report = fx.processor.process_queue().await.unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.remaining, 2);
        assert_eq!(fx.backend.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_offline_aborts_backoff() {
        let fx = fixture().await;
        fx.backend.fail_next_writes(5, Failure::Server(500));
        queue_change(&fx, "mem_001", Some("din_001"), DiningStatus::Dining);

        let processor = fx.processor.clone();
        let start = Instant::now();
        let flush = tokio::spawn(async move { processor.process_queue().await });

        tokio::time::sleep(Duration::from_millis(500)).await;
        fx.host.go_offline();

        let report = flush.await.unwrap().unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.remaining, 1);
        assert_eq!(fx.backend.write_count(), 1);
        assert!(start.elapsed() < INITIAL_RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_refetch_when_connection_dropped() {
        let fx = fixture().await;
        queue_change(&fx, "mem_001", Some("din_001"), DiningStatus::Dining);

        fx.connection.set_status(ConnectionStatus::Reconnecting);
        fx.backend.fail_lists(Some(Failure::Network));

        let report = fx.processor.process_queue().await.unwrap();
        assert_eq!(report.synced, 1);

        let entry = fx.cache.get(LODGE).unwrap();
        assert!(entry.error.is_none());
        assert!(!entry.stale);
        assert_eq!(
            fx.cache.member_row(LODGE, "mem_001").unwrap().status,
            DiningStatus::Dining
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_flush_is_noop() {
        let fx = fixture().await;
        fx.backend.set_latency(Some(Duration::from_millis(100)));
        queue_change(&fx, "mem_001", Some("din_001"), DiningStatus::Dining);

        let (a, b) = tokio::join!(
            fx.processor.process_queue(),
            fx.processor.process_queue()
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.skipped != b.skipped);
        assert_eq!(a.synced + b.synced, 1);
        assert_eq!(fx.backend.write_count(), 1);

        // The guard is released afterwards
        let again = fx.processor.process_queue().await.unwrap();
        assert!(!again.skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_flushes_on_reconnect() {
        let fx = fixture().await;
        fx.connection.set_status(ConnectionStatus::Offline);
        let trigger = fx.processor.spawn_flush_trigger();

        queue_change(&fx, "mem_002", None, DiningStatus::Dining);
        fx.connection.set_status(ConnectionStatus::Connected);

        for _ in 0..50 {
            if fx.processor.projection().queued_member_ids().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fx.processor.projection().queued_member_ids().is_empty());
        assert_eq!(fx.backend.write_count(), 1);

        fx.processor.stop();
        trigger.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_replaced_during_backoff_replays_newest() {
        let fx = fixture().await;
        fx.backend.fail_next_writes(1, Failure::Server(503));
        queue_change(&fx, "mem_001", Some("din_001"), DiningStatus::Dining);

        let processor = fx.processor.clone();
        let flush = tokio::spawn(async move { processor.process_queue().await });

        tokio::time::sleep(Duration::from_millis(500)).await;
        queue_change(&fx, "mem_001", Some("din_001"), DiningStatus::Undecided);

        let report = flush.await.unwrap().unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.remaining, 0);

        let writes = fx.backend.writes();
        assert_eq!(writes.len(), 2);
        assert!(!writes[0].succeeded);
        assert_eq!(writes[1].fields["status"], "undecided");
        assert_eq!(
            fx.cache.member_row(LODGE, "mem_001").unwrap().status,
            DiningStatus::Undecided
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_mid_flush_is_returned() {
        let fx = fixture().await;
        let mut events = fx.processor.subscribe_events();
        fx.backend.set_latency(Some(Duration::from_millis(100)));
        queue_change(&fx, "mem_001", Some("din_001"), DiningStatus::Dining);

        let processor = fx.processor.clone();
        let flush = tokio::spawn(async move { processor.process_queue().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.processor.queue.break_storage().unwrap();

        let err = flush.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Queue(_)));
        assert!(fx.processor.projection().syncing_member_ids().is_empty());
        assert!(!fx.processor.processing.load(Ordering::SeqCst));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_enqueue_rejects_blank_member() {
        let queue = MutationQueue::open_in_memory().unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let repository = DiningRepository::new(backend);
        let processor = QueueProcessor::new(
            queue.clone(),
            QueueProjection::new(),
            repository.clone(),
            DashboardQuery::new(DashboardCache::new(), repository),
            ConnectionStore::new(),
            Arc::new(ManualHost::new(false)),
        );

        let err = processor
            .enqueue(NewMutation::new(LODGE, "", None, DiningStatus::Dining))
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert!(queue.is_empty().unwrap());
    }
}
