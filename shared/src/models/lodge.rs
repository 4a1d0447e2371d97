//! Lodge Model

use serde::{Deserialize, Serialize};

/// `lodges` collection row as returned by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LodgeRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub province: String,
    #[serde(default)]
    pub meeting_location: String,
}

/// Lodge entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lodge {
    pub id: String,
    pub name: String,
    pub province: String,
    pub meeting_location: String,
}

impl From<LodgeRecord> for Lodge {
    fn from(record: LodgeRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            province: record.province,
            meeting_location: record.meeting_location,
        }
    }
}
