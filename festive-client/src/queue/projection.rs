//! In-memory projection of the mutation queue
//!
//! Tracks each queued write's lifecycle for the UI:
//!
//! ```text
//! queued (clock icon) ──▶ syncing (spinner) ──▶ gone (synced)
//! ```
//!
//! Nothing here is persisted. The durable queue is the source of truth and
//! `set_queued_state` rebuilds this view from it.

use std::collections::HashSet;
use tokio::sync::watch;

use super::store::QueuedMutation;

/// Point-in-time view of the projection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectionState {
    /// Waiting for connectivity
    pub queued_member_ids: HashSet<String>,
    /// Being sent to the backend
    pub syncing_member_ids: HashSet<String>,
    /// Full queued rows, used to overlay the user's intended status
    pub queued_mutations: Vec<QueuedMutation>,
}

impl ProjectionState {
    pub fn is_queued(&self, member_id: &str) -> bool {
        self.queued_member_ids.contains(member_id)
    }

    pub fn is_syncing(&self, member_id: &str) -> bool {
        self.syncing_member_ids.contains(member_id)
    }

    /// Queued or syncing: push events for this member must not refetch
    pub fn is_in_flight(&self, member_id: &str) -> bool {
        self.is_queued(member_id) || self.is_syncing(member_id)
    }

    pub fn queued_mutation(&self, member_id: &str) -> Option<&QueuedMutation> {
        self.queued_mutations
            .iter()
            .find(|m| m.member_id == member_id)
    }
}

/// Shared handle to the projection. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct QueueProjection {
    state: watch::Sender<ProjectionState>,
}

impl QueueProjection {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ProjectionState::default());
        Self { state }
    }

    pub fn snapshot(&self) -> ProjectionState {
        self.state.borrow().clone()
    }

    /// Change notifications for renderers
    pub fn subscribe(&self) -> watch::Receiver<ProjectionState> {
        self.state.subscribe()
    }

    pub fn queued_member_ids(&self) -> HashSet<String> {
        self.state.borrow().queued_member_ids.clone()
    }

    pub fn syncing_member_ids(&self) -> HashSet<String> {
        self.state.borrow().syncing_member_ids.clone()
    }

    pub fn queued_mutations(&self) -> Vec<QueuedMutation> {
        self.state.borrow().queued_mutations.clone()
    }

    pub fn is_in_flight(&self, member_id: &str) -> bool {
        self.state.borrow().is_in_flight(member_id)
    }

    /// Replace the queued view with what the durable queue holds
    pub fn set_queued_state(&self, ids: HashSet<String>, mutations: Vec<QueuedMutation>) {
        self.state.send_modify(|state| {
            state.queued_member_ids = ids;
            state.queued_mutations = mutations;
        });
    }

    pub fn add_syncing(&self, member_id: &str) {
        self.state.send_modify(|state| {
            state.syncing_member_ids.insert(member_id.to_string());
        });
    }

    pub fn remove_queued(&self, member_id: &str) {
        self.state.send_modify(|state| {
            state.queued_member_ids.remove(member_id);
            state.queued_mutations.retain(|m| m.member_id != member_id);
        });
    }

    pub fn remove_syncing(&self, member_id: &str) {
        self.state.send_modify(|state| {
            state.syncing_member_ids.remove(member_id);
        });
    }

    pub fn clear(&self) {
        self.state.send_replace(ProjectionState::default());
    }
}

impl Default for QueueProjection {
    fn default() -> Self {
        Self::new()
    }
}
