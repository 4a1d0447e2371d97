//! Dashboard rows as rendered
//!
//! Overlays the queue projection on cached server rows so the user's
//! intended status survives reloads, and picks a single indicator per row.

use serde::{Deserialize, Serialize};
use shared::models::DiningTableRow;
use std::collections::HashSet;

use crate::queue::ProjectionState;

/// Per-row activity indicator; at most one shows at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowIndicator {
    /// Replaying to the backend (spinner)
    Syncing,
    /// Waiting for connectivity (clock)
    Queued,
    /// Online write in flight
    Pending,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardRow {
    #[serde(flatten)]
    pub row: DiningTableRow,
    pub indicator: RowIndicator,
}

/// Merge cached rows with queued intents.
///
/// Indicator precedence is syncing, then queued, then pending.
pub fn overlay_rows(
    rows: &[DiningTableRow],
    projection: &ProjectionState,
    pending: &HashSet<String>,
) -> Vec<DashboardRow> {
    rows.iter()
        .map(|row| {
            let mut row = row.clone();
            if let Some(queued) = projection.queued_mutation(&row.member_id) {
                row.status = queued.new_status;
            }

            let indicator = if projection.is_syncing(&row.member_id) {
                RowIndicator::Syncing
            } else if projection.is_queued(&row.member_id) {
                RowIndicator::Queued
            } else if pending.contains(&row.member_id) {
                RowIndicator::Pending
            } else {
                RowIndicator::None
            };

            DashboardRow { row, indicator }
        })
        .collect()
}
