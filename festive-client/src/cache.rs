//! Dashboard read-cache
//!
//! Query-keyed snapshot of server state, one entry per lodge under the
//! `dining-dashboard` key. Optimistic patches and queue replay write into
//! it row by row; invalidation marks entries stale and refetches them.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use shared::models::{DiningStatus, DiningTableRow};
use std::collections::HashMap;
use std::sync::Arc;

use crate::ClientResult;
use crate::repository::DiningRepository;

/// Query key of the dashboard view
pub const DASHBOARD_QUERY: &str = "dining-dashboard";

/// Cached result of one dashboard query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryEntry {
    pub rows: Vec<DiningTableRow>,
    /// Needs a refetch
    pub stale: bool,
    /// Last refetch failure; rows are the last good data
    pub error: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Shared read-cache. Cloning shares the same entries.
#[derive(Debug, Clone, Default)]
pub struct DashboardCache {
    entries: Arc<RwLock<HashMap<String, QueryEntry>>>,
}

impl DashboardCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, lodge_id: &str) -> Option<QueryEntry> {
        self.entries.read().get(lodge_id).cloned()
    }

    pub fn rows(&self, lodge_id: &str) -> Option<Vec<DiningTableRow>> {
        self.entries.read().get(lodge_id).map(|e| e.rows.clone())
    }

    pub fn member_row(&self, lodge_id: &str, member_id: &str) -> Option<DiningTableRow> {
        self.entries
            .read()
            .get(lodge_id)
            .and_then(|e| e.rows.iter().find(|r| r.member_id == member_id).cloned())
    }

    /// Store fresh server data
    pub fn set(&self, lodge_id: &str, rows: Vec<DiningTableRow>) {
        self.entries.write().insert(
            lodge_id.to_string(),
            QueryEntry {
                rows,
                stale: false,
                error: None,
                fetched_at: Some(Utc::now()),
            },
        );
    }

    /// Edit the rows in place, creating an empty entry if needed
    pub fn update_rows(&self, lodge_id: &str, f: impl FnOnce(&mut Vec<DiningTableRow>)) {
        let mut entries = self.entries.write();
        let entry = entries.entry(lodge_id.to_string()).or_default();
        f(&mut entry.rows);
    }

    /// Set one member's status (and record id, when known). Returns whether a row matched.
    pub fn patch_member(
        &self,
        lodge_id: &str,
        member_id: &str,
        status: DiningStatus,
        record_id: Option<&str>,
    ) -> bool {
        let mut patched = false;
        self.update_rows(lodge_id, |rows| {
            if let Some(row) = rows.iter_mut().find(|r| r.member_id == member_id) {
                row.status = status;
                if let Some(id) = record_id {
                    row.dining_record_id = Some(id.to_string());
                }
                patched = true;
            }
        });
        patched
    }

    /// Record the server id of a member's row without touching its status.
    ///
    /// Used when a newer optimistic status must stay on screen.
    pub fn remember_record_id(&self, lodge_id: &str, member_id: &str, record_id: &str) -> bool {
        let mut patched = false;
        self.update_rows(lodge_id, |rows| {
            if let Some(row) = rows.iter_mut().find(|r| r.member_id == member_id) {
                row.dining_record_id = Some(record_id.to_string());
                patched = true;
            }
        });
        patched
    }

    /// Apply `f` to one member's row and return a handle that can restore
    /// exactly that row. Other rows are never touched by the rollback.
    pub fn patch_member_with_snapshot(
        &self,
        lodge_id: &str,
        member_id: &str,
        f: impl FnOnce(&mut DiningTableRow),
    ) -> Rollback {
        let mut entries = self.entries.write();
        let previous = entries
            .get_mut(lodge_id)
            .and_then(|e| e.rows.iter_mut().find(|r| r.member_id == member_id))
            .map(|row| {
                let previous = row.clone();
                f(row);
                previous
            });

        Rollback {
            cache: self.clone(),
            lodge_id: lodge_id.to_string(),
            previous,
        }
    }

    pub fn set_error(&self, lodge_id: &str, error: impl Into<String>) {
        let mut entries = self.entries.write();
        let entry = entries.entry(lodge_id.to_string()).or_default();
        entry.error = Some(error.into());
    }

    /// Mark one lodge's dashboard stale
    pub fn invalidate(&self, lodge_id: &str) {
        if let Some(entry) = self.entries.write().get_mut(lodge_id) {
            entry.stale = true;
        }
    }

    /// Mark every dashboard stale
    pub fn invalidate_all(&self) {
        for entry in self.entries.write().values_mut() {
            entry.stale = true;
        }
    }

    pub fn stale_lodges(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| e.stale)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Pre-mutation snapshot of one cached row
#[must_use = "call `restore` on failure or `commit` on success"]
#[derive(Debug)]
pub struct Rollback {
    cache: DashboardCache,
    lodge_id: String,
    previous: Option<DiningTableRow>,
}

impl Rollback {
    /// Put the row's status back as it was when the snapshot was taken.
    ///
    /// A record id learned since the snapshot is kept, so the next toggle
    /// updates that record instead of creating another one.
    pub fn restore(self) {
        let Some(previous) = self.previous else {
            return;
        };
        self.cache.update_rows(&self.lodge_id, |rows| {
            if let Some(row) = rows.iter_mut().find(|r| r.member_id == previous.member_id) {
                row.status = previous.status;
                if row.dining_record_id.is_none() {
                    row.dining_record_id = previous.dining_record_id;
                }
            }
        });
    }

    /// Keep the patched row
    pub fn commit(self) {}
}

/// Loads dashboards into the cache
#[derive(Debug, Clone)]
pub struct DashboardQuery {
    cache: DashboardCache,
    repository: DiningRepository,
}

impl DashboardQuery {
    pub fn new(cache: DashboardCache, repository: DiningRepository) -> Self {
        Self { cache, repository }
    }

    pub fn cache(&self) -> &DashboardCache {
        &self.cache
    }

    /// Fetch from the backend and store the result.
    ///
    /// On failure the entry keeps its last good rows and records the error.
    pub async fn fetch(&self, lodge_id: &str) -> ClientResult<Vec<DiningTableRow>> {
        match self.repository.fetch_dining_dashboard(lodge_id).await {
            Ok(rows) => {
                self.cache.set(lodge_id, rows.clone());
                Ok(rows)
            }
            Err(e) => {
                tracing::warn!(lodge_id, error = %e, "Dashboard fetch failed");
                self.cache.set_error(lodge_id, e.to_string());
                Err(e)
            }
        }
    }

    /// Refetch every stale entry; returns how many refreshed successfully
    pub async fn refetch_stale(&self) -> usize {
        let mut refreshed = 0;
        for lodge_id in self.cache.stale_lodges() {
            if self.fetch(&lodge_id).await.is_ok() {
                refreshed += 1;
            }
        }
        refreshed
    }

    /// Invalidate one lodge and refetch it
    pub async fn invalidate(&self, lodge_id: &str) {
        self.cache.invalidate(lodge_id);
        self.refetch_stale().await;
    }

    /// Invalidate every dashboard and refetch
    pub async fn invalidate_all(&self) {
        self.cache.invalidate_all();
        let refreshed = self.refetch_stale().await;
        tracing::debug!(refreshed, "Dashboard cache refreshed");
    }
}
