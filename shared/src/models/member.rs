//! Member Model

use serde::{Deserialize, Serialize};

use super::dining::DiningStatus;

/// Roster membership status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Active,
    Honorary,
    Resigned,
}

/// `members` collection row as returned by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRecord {
    pub id: String,
    pub lodge_id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub rank: String,
    pub status: MemberStatus,
}

/// Member entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: String,
    pub lodge_id: String,
    pub first_name: String,
    pub last_name: String,
    pub rank: String,
    pub status: MemberStatus,
}

impl Member {
    /// Resigned members never appear on the dining dashboard
    pub fn is_eligible(&self) -> bool {
        self.status != MemberStatus::Resigned
    }
}

impl From<MemberRecord> for Member {
    fn from(record: MemberRecord) -> Self {
        Self {
            id: record.id,
            lodge_id: record.lodge_id,
            first_name: record.first_name,
            last_name: record.last_name,
            rank: record.rank,
            status: record.status,
        }
    }
}

/// Outbound status change for one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberEntry {
    pub member_id: String,
    pub status: DiningStatus,
}

impl MemberEntry {
    pub fn new(member_id: impl Into<String>, status: DiningStatus) -> Self {
        Self {
            member_id: member_id.into(),
            status,
        }
    }

    /// Reject malformed payloads before they reach the API or the queue
    pub fn validate(&self) -> Result<(), String> {
        if self.member_id.trim().is_empty() {
            return Err("Member identifier is required".to_string());
        }
        Ok(())
    }
}
