//! Dining Model

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::member::Member;

/// Dining declaration for a member at an upcoming meeting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiningStatus {
    Dining,
    NotDining,
    Undecided,
}

impl DiningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiningStatus::Dining => "dining",
            DiningStatus::NotDining => "not_dining",
            DiningStatus::Undecided => "undecided",
        }
    }
}

impl fmt::Display for DiningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DiningStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dining" => Ok(DiningStatus::Dining),
            "not_dining" => Ok(DiningStatus::NotDining),
            "undecided" => Ok(DiningStatus::Undecided),
            other => Err(format!("unknown dining status: {other}")),
        }
    }
}

/// `dining_records` collection row as returned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiningRecord {
    pub id: String,
    pub lodge_id: String,
    pub member_id: String,
    pub meeting_date: String,
    pub status: DiningStatus,
    #[serde(default)]
    pub updated_by: String,
}

/// Create dining record payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiningRecordCreate {
    pub lodge_id: String,
    pub member_id: String,
    pub meeting_date: String,
    pub status: DiningStatus,
    pub updated_by: String,
}

/// Update dining record payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiningRecordUpdate {
    pub status: DiningStatus,
}

/// One member's declared status for one meeting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiningEntry {
    pub id: String,
    pub lodge_id: String,
    pub member_id: String,
    pub meeting_date: String,
    pub status: DiningStatus,
    pub updated_by: String,
}

impl From<DiningRecord> for DiningEntry {
    fn from(record: DiningRecord) -> Self {
        Self {
            id: record.id,
            lodge_id: record.lodge_id,
            member_id: record.member_id,
            meeting_date: record.meeting_date,
            status: record.status,
            updated_by: record.updated_by,
        }
    }
}

/// Dashboard row: a roster member merged with their (optional) dining entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiningTableRow {
    pub member_id: String,
    /// `None` until the first write for this member succeeds
    pub dining_record_id: Option<String>,
    pub rank: String,
    pub first_name: String,
    pub last_name: String,
    pub status: DiningStatus,
}

/// Merge the roster with dining entries.
///
/// Resigned members are dropped; roster order is kept. Members without an
/// entry show as `undecided` with no record id.
pub fn merge_members_with_dining(
    members: &[Member],
    entries: &[DiningEntry],
) -> Vec<DiningTableRow> {
    let by_member: HashMap<&str, &DiningEntry> = entries
        .iter()
        .map(|entry| (entry.member_id.as_str(), entry))
        .collect();

    members
        .iter()
        .filter(|member| member.is_eligible())
        .map(|member| {
            let dining = by_member.get(member.id.as_str());
            DiningTableRow {
                member_id: member.id.clone(),
                dining_record_id: dining.map(|d| d.id.clone()),
                rank: member.rank.clone(),
                first_name: member.first_name.clone(),
                last_name: member.last_name.clone(),
                status: dining.map(|d| d.status).unwrap_or(DiningStatus::Undecided),
            }
        })
        .collect()
}
