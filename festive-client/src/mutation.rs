//! Optimistic dining status toggle
//!
//! The cache row flips immediately. Then:
//!
//! - not connected: the edit is queued and reported as accepted
//! - member still queued or syncing: the edit is queued behind that change,
//!   replacing it, so a replay can never overwrite the newer status
//! - connected: the write goes straight to the backend; a network-class
//!   failure falls back to the queue, a rejection restores the row

use parking_lot::Mutex;
use shared::models::{DiningEntry, DiningStatus, MemberEntry};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::cache::DashboardCache;
use crate::connection::ConnectionStore;
use crate::queue::{NewMutation, QueueProcessor, QueuedMutation};
use crate::repository::DiningRepository;
use crate::{ClientError, ClientResult};

/// How a toggle was accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// Stored by the backend
    Written(DiningEntry),
    /// Deferred until the connection returns
    Queued(QueuedMutation),
}

impl ToggleOutcome {
    /// Status the user now sees
    pub fn status(&self) -> DiningStatus {
        match self {
            ToggleOutcome::Written(entry) => entry.status,
            ToggleOutcome::Queued(mutation) => mutation.new_status,
        }
    }
}

/// Members with an online write in flight
#[derive(Debug, Clone, Default)]
pub struct PendingMembers {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl PendingMembers {
    pub fn snapshot(&self) -> HashSet<String> {
        self.counts.lock().keys().cloned().collect()
    }

    pub fn contains(&self, member_id: &str) -> bool {
        self.counts.lock().contains_key(member_id)
    }

    fn begin(&self, member_id: &str) -> PendingGuard {
        *self.counts.lock().entry(member_id.to_string()).or_insert(0) += 1;
        PendingGuard {
            counts: self.counts.clone(),
            member_id: member_id.to_string(),
        }
    }
}

/// Clears the pending mark on every exit path
struct PendingGuard {
    counts: Arc<Mutex<HashMap<String, usize>>>,
    member_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(&self.member_id) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.member_id);
            }
        }
    }
}

/// Status toggles for one lodge's dashboard
#[derive(Debug, Clone)]
pub struct DiningMutation {
    lodge_id: String,
    cache: DashboardCache,
    repository: DiningRepository,
    processor: QueueProcessor,
    connection: ConnectionStore,
    pending: PendingMembers,
}

impl DiningMutation {
    pub fn new(
        lodge_id: impl Into<String>,
        cache: DashboardCache,
        repository: DiningRepository,
        processor: QueueProcessor,
        connection: ConnectionStore,
    ) -> Self {
        Self {
            lodge_id: lodge_id.into(),
            cache,
            repository,
            processor,
            connection,
            pending: PendingMembers::default(),
        }
    }

    pub fn lodge_id(&self) -> &str {
        &self.lodge_id
    }

    pub fn pending(&self) -> &PendingMembers {
        &self.pending
    }

    /// Set a member's dining status.
    ///
    /// `current_record_id` selects update (`Some`) or create (`None`).
    pub async fn toggle_status(
        &self,
        member_id: &str,
        current_record_id: Option<&str>,
        new_status: DiningStatus,
    ) -> ClientResult<ToggleOutcome> {
        MemberEntry::new(member_id, new_status)
            .validate()
            .map_err(ClientError::Validation)?;

        let _pending = self.pending.begin(member_id);
        let rollback = self
            .cache
            .patch_member_with_snapshot(&self.lodge_id, member_id, |row| {
                row.status = new_status;
            });

        let queued_ahead = self.processor.projection().is_in_flight(member_id);
        if queued_ahead {
            tracing::debug!(member_id, "Earlier change for member not synced yet, queueing");
        }

        if queued_ahead || !self.connection.is_connected() {
            return match self.defer(member_id, current_record_id, new_status) {
                Ok(queued) => {
                    rollback.commit();
                    Ok(ToggleOutcome::Queued(queued))
                }
                Err(e) => {
                    rollback.restore();
                    Err(e)
                }
            };
        }

        let result = self
            .repository
            .write_status(&self.lodge_id, member_id, current_record_id, new_status)
            .await;

        match result {
            Ok(entry) => {
                rollback.commit();
                // Record id matters for creates; realtime handles the full refresh
                self.cache
                    .patch_member(&self.lodge_id, member_id, entry.status, Some(&entry.id));
                tracing::debug!(member_id, record_id = %entry.id, status = %entry.status, "Dining status written");
                Ok(ToggleOutcome::Written(entry))
            }
            Err(e) if e.is_network() => {
                tracing::warn!(member_id, error = %e, "Backend unreachable, queueing dining change");
                match self.defer(member_id, current_record_id, new_status) {
                    Ok(queued) => {
                        rollback.commit();
                        Ok(ToggleOutcome::Queued(queued))
                    }
                    Err(queue_err) => {
                        rollback.restore();
                        Err(queue_err)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(member_id, error = %e, "Dining status rejected, rolling back");
                rollback.restore();
                Err(e)
            }
        }
    }

    fn defer(
        &self,
        member_id: &str,
        current_record_id: Option<&str>,
        new_status: DiningStatus,
    ) -> ClientResult<QueuedMutation> {
        self.processor.enqueue(NewMutation::new(
            self.lodge_id.as_str(),
            member_id,
            current_record_id.map(str::to_string),
            new_status,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DINING_RECORDS, MEMBERS};
    use crate::cache::DashboardQuery;
    use crate::connection::ConnectionStatus;
    use crate::memory::{Failure, InMemoryBackend, ManualHost};
    use crate::queue::{MutationQueue, QueueProjection};
    use serde_json::json;
    use std::time::Duration;

    const LODGE: &str = "lodge_001";

    struct Fixture {
        backend: Arc<InMemoryBackend>,
        connection: ConnectionStore,
        cache: DashboardCache,
        queue: MutationQueue,
        processor: QueueProcessor,
        mutation: DiningMutation,
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
        for (id, member) in [("din_001", "mem_001"), ("din_002", "mem_002")] {
            backend.insert(
                DINING_RECORDS,
                json!({
                    "id": id, "lodge_id": LODGE, "member_id": member,
                    "meeting_date": "2026-02-14T19:00:00.000Z", "status": "not_dining",
                    "updated_by": "secretary"
                }),
            );
        }

        let connection = ConnectionStore::new();
        connection.set_status(ConnectionStatus::Connected);
        let repository = DiningRepository::new(backend.clone());
        let cache = DashboardCache::new();
        let dashboard = DashboardQuery::new(cache.clone(), repository.clone());
        dashboard.fetch(LODGE).await.unwrap();

        let queue = MutationQueue::open_in_memory().unwrap();
        let processor = QueueProcessor::new(
            queue.clone(),
            QueueProjection::new(),
            repository.clone(),
            dashboard,
            connection.clone(),
            Arc::new(ManualHost::new(true)),
        );
        let mutation = DiningMutation::new(
            LODGE,
            cache.clone(),
            repository,
            processor.clone(),
            connection.clone(),
        );

        Fixture {
            backend,
            connection,
            cache,
            queue,
            processor,
            mutation,
        }
    }

    fn status_of(fx: &Fixture, member_id: &str) -> DiningStatus {
        fx.cache.member_row(LODGE, member_id).unwrap().status
    }

    #[tokio::test]
    async fn test_online_update_patches_without_invalidation() {
        let fx = fixture().await;

        let outcome = fx
            .mutation
            .toggle_status("mem_001", Some("din_001"), DiningStatus::Dining)
            .await
            .unwrap();

        assert!(matches!(outcome, ToggleOutcome::Written(ref e) if e.id == "din_001"));
        assert_eq!(status_of(&fx, "mem_001"), DiningStatus::Dining);
        assert!(!fx.cache.get(LODGE).unwrap().stale);
        assert!(fx.mutation.pending().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_online_create_remembers_server_id() {
        let fx = fixture().await;
        fx.backend.push_next_id("din_099");

        fx.mutation
            .toggle_status("mem_003", None, DiningStatus::Dining)
            .await
            .unwrap();

        let rows = fx.cache.rows(LODGE).unwrap();
        let mem_003: Vec<_> = rows.iter().filter(|r| r.member_id == "mem_003").collect();
        assert_eq!(mem_003.len(), 1);
        assert_eq!(mem_003[0].dining_record_id.as_deref(), Some("din_099"));
        assert_eq!(mem_003[0].status, DiningStatus::Dining);
    }

    #[tokio::test]
    async fn test_offline_toggle_is_queued_without_network() {
        let fx = fixture().await;
        fx.connection.set_status(ConnectionStatus::Reconnecting);

        let outcome = fx
            .mutation
            .toggle_status("mem_002", Some("din_002"), DiningStatus::Dining)
            .await
            .unwrap();

        assert_eq!(outcome.status(), DiningStatus::Dining);
        assert!(matches!(outcome, ToggleOutcome::Queued(_)));
        assert_eq!(fx.backend.write_count(), 0);
        assert_eq!(status_of(&fx, "mem_002"), DiningStatus::Dining);
        assert!(fx.processor.projection().snapshot().is_queued("mem_002"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_restores_only_that_row() {
        let fx = fixture().await;
        fx.backend.set_latency(Some(Duration::from_millis(100)));
        fx.backend.fail_next_writes(1, Failure::Server(500));

        let mutation = fx.mutation.clone();
        let toggle = tokio::spawn(async move {
            mutation
                .toggle_status("mem_001", Some("din_001"), DiningStatus::Dining)
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(status_of(&fx, "mem_001"), DiningStatus::Dining);
        assert!(fx.mutation.pending().contains("mem_001"));
        fx.cache
            .patch_member(LODGE, "mem_002", DiningStatus::Undecided, None);

        let err = toggle.await.unwrap().unwrap_err();
        assert!(!err.is_network());

        assert_eq!(status_of(&fx, "mem_001"), DiningStatus::NotDining);
        assert_eq!(status_of(&fx, "mem_002"), DiningStatus::Undecided);
        assert!(!fx.mutation.pending().contains("mem_001"));
        assert!(fx.processor.projection().queued_member_ids().is_empty());
    }

    #[tokio::test]
    async fn test_network_failure_while_connected_defers() {
        let fx = fixture().await;
        fx.backend.fail_next_writes(1, Failure::Network);

        let outcome = fx
            .mutation
            .toggle_status("mem_001", Some("din_001"), DiningStatus::Dining)
            .await
            .unwrap();

        assert!(matches!(outcome, ToggleOutcome::Queued(ref q) if q.dining_record_id.as_deref() == Some("din_001")));
        assert_eq!(status_of(&fx, "mem_001"), DiningStatus::Dining);
        assert!(fx.processor.projection().snapshot().is_queued("mem_001"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_toggle_rolls_back_to_first() {
        let fx = fixture().await;
        fx.backend.set_latency(Some(Duration::from_millis(100)));

        let first = {
            let mutation = fx.mutation.clone();
            tokio::spawn(async move {
                mutation
                    .toggle_status("mem_001", Some("din_001"), DiningStatus::Dining)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = {
            let mutation = fx.mutation.clone();
            tokio::spawn(async move {
                mutation
                    .toggle_status("mem_001", Some("din_001"), DiningStatus::Undecided)
                    .await
            })
        };

        // First write lands at 100ms; fail only the second one (lands at 110ms)
        tokio::time::sleep(Duration::from_millis(95)).await;
        fx.backend.fail_next_writes(1, Failure::Server(500));

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_err());

        assert_eq!(status_of(&fx, "mem_001"), DiningStatus::Dining);
        assert!(fx.mutation.pending().snapshot().is_empty());
    }

    fn spawn_flush(fx: &Fixture) -> tokio::task::JoinHandle<ClientResult<crate::queue::SyncReport>> {
        let processor = fx.processor.clone();
        tokio::spawn(async move { processor.process_queue().await })
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_during_flush_keeps_latest_intent() {
        let fx = fixture().await;
        fx.connection.set_status(ConnectionStatus::Reconnecting);
        fx.mutation
            .toggle_status("mem_002", Some("din_002"), DiningStatus::Dining)
            .await
            .unwrap();
        fx.mutation
            .toggle_status("mem_001", Some("din_001"), DiningStatus::Dining)
            .await
            .unwrap();

        fx.connection.set_status(ConnectionStatus::Connected);
        fx.backend.set_latency(Some(Duration::from_millis(100)));
        let flush = spawn_flush(&fx);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // mem_001 is still queued behind mem_002's replay
        let outcome = fx
            .mutation
            .toggle_status("mem_001", Some("din_001"), DiningStatus::Undecided)
            .await
            .unwrap();
        assert!(matches!(outcome, ToggleOutcome::Queued(_)));

        let report = flush.await.unwrap().unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(report.remaining, 0);

        let din_001 = fx
            .backend
            .records(DINING_RECORDS)
            .into_iter()
            .find(|r| r["id"] == "din_001")
            .unwrap();
        assert_eq!(din_001["status"], "undecided");
        assert_eq!(status_of(&fx, "mem_001"), DiningStatus::Undecided);

        let writes_for_din_001 = fx
            .backend
            .writes()
            .into_iter()
            .filter(|w| w.id.as_deref() == Some("din_001"))
            .count();
        assert_eq!(writes_for_din_001, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_while_create_syncs_reuses_new_record() {
        let fx = fixture().await;
        fx.connection.set_status(ConnectionStatus::Reconnecting);
        fx.mutation
            .toggle_status("mem_003", None, DiningStatus::Dining)
            .await
            .unwrap();

        fx.connection.set_status(ConnectionStatus::Connected);
        fx.backend.set_latency(Some(Duration::from_millis(100)));
        fx.backend.push_next_id("din_099");
        let flush = spawn_flush(&fx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fx.processor.projection().snapshot().is_syncing("mem_003"));

        let outcome = fx
            .mutation
            .toggle_status("mem_003", None, DiningStatus::NotDining)
            .await
            .unwrap();
        assert!(matches!(outcome, ToggleOutcome::Queued(_)));

        let report = flush.await.unwrap().unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.remaining, 0);

        let writes = fx.backend.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].id, None);
        assert_eq!(writes[1].id.as_deref(), Some("din_099"));
        assert_eq!(writes[1].fields["status"], "not_dining");

        let for_member = fx
            .backend
            .records(DINING_RECORDS)
            .into_iter()
            .filter(|r| r["member_id"] == "mem_003")
            .count();
        assert_eq!(for_member, 1);

        let row = fx.cache.member_row(LODGE, "mem_003").unwrap();
        assert_eq!(row.status, DiningStatus::NotDining);
        assert_eq!(row.dining_record_id.as_deref(), Some("din_099"));
    }

    #[tokio::test]
    async fn test_unavailable_queue_restores_row() {
        let fx = fixture().await;
        fx.queue.break_storage().unwrap();

        // Offline: the edit cannot be kept anywhere
        fx.connection.set_status(ConnectionStatus::Offline);
        let err = fx
            .mutation
            .toggle_status("mem_001", Some("din_001"), DiningStatus::Dining)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Queue(_)));
        assert_eq!(status_of(&fx, "mem_001"), DiningStatus::NotDining);

        // Online but unreachable: same outcome after the write fails
        fx.connection.set_status(ConnectionStatus::Connected);
        fx.backend.fail_next_writes(1, Failure::Network);
        let err = fx
            .mutation
            .toggle_status("mem_002", Some("din_002"), DiningStatus::Dining)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Queue(_)));
        assert_eq!(status_of(&fx, "mem_002"), DiningStatus::NotDining);

        assert!(fx.mutation.pending().snapshot().is_empty());
        assert_eq!(fx.backend.write_count(), 1);
    }

    #[tokio::test]
    async fn test_blank_member_rejected() {
        let fx = fixture().await;
        let err = fx
            .mutation
            .toggle_status("", None, DiningStatus::Dining)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert_eq!(fx.backend.write_count(), 0);
    }
}
