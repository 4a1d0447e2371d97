//! Dining repository
//!
//! Typed calls over a [`RecordBackend`]: builds the dashboard view and
//! performs the create/update writes used by both the online path and
//! queue replay.

use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::models::{
    DiningEntry, DiningRecord, DiningRecordCreate, DiningRecordUpdate, DiningStatus,
    DiningTableRow, Lodge, LodgeRecord, Member, MemberEntry, MemberRecord,
    merge_members_with_dining,
};
use std::sync::Arc;

use crate::backend::{DINING_RECORDS, LODGES, ListQuery, MEMBERS, RecordBackend};
use crate::queue::QueuedMutation;
use crate::{ClientError, ClientResult};

/// Recorded as `updated_by` on records this client creates
pub const UPDATED_BY: &str = "secretary";

#[derive(Debug, Clone)]
pub struct DiningRepository {
    backend: Arc<dyn RecordBackend>,
}

impl DiningRepository {
    pub fn new(backend: Arc<dyn RecordBackend>) -> Self {
        Self { backend }
    }

    /// Roster (sorted by last name) merged with the lodge's dining records
    pub async fn fetch_dining_dashboard(&self, lodge_id: &str) -> ClientResult<Vec<DiningTableRow>> {
        let members_query = ListQuery::new()
            .field_eq("lodge_id", lodge_id)
            .sort("last_name");
        let dining_query = ListQuery::new().field_eq("lodge_id", lodge_id);

        let (member_records, dining_records) = futures::future::try_join(
            self.backend.list(MEMBERS, &members_query),
            self.backend.list(DINING_RECORDS, &dining_query),
        )
        .await?;

        let members: Vec<Member> = decode_all::<MemberRecord>(member_records)?
            .into_iter()
            .map(Member::from)
            .collect();
        let dining: Vec<DiningEntry> = decode_all::<DiningRecord>(dining_records)?
            .into_iter()
            .map(DiningEntry::from)
            .collect();

        Ok(merge_members_with_dining(&members, &dining))
    }

    pub async fn update_dining_status(
        &self,
        record_id: &str,
        status: DiningStatus,
    ) -> ClientResult<DiningEntry> {
        let fields = serde_json::to_value(DiningRecordUpdate { status })?;
        let record = self
            .backend
            .write(DINING_RECORDS, Some(record_id), fields)
            .await?;
        decode::<DiningRecord>(record).map(DiningEntry::from)
    }

    /// First status for a member at the upcoming meeting
    pub async fn create_dining_record(
        &self,
        lodge_id: &str,
        entry: &MemberEntry,
    ) -> ClientResult<DiningEntry> {
        entry.validate().map_err(ClientError::Validation)?;

        let payload = DiningRecordCreate {
            lodge_id: lodge_id.to_string(),
            member_id: entry.member_id.clone(),
            meeting_date: shared::util::now_rfc3339(),
            status: entry.status,
            updated_by: UPDATED_BY.to_string(),
        };
        let record = self
            .backend
            .write(DINING_RECORDS, None, serde_json::to_value(payload)?)
            .await?;
        decode::<DiningRecord>(record).map(DiningEntry::from)
    }

    /// Update when a record id is known, otherwise create
    pub async fn write_status(
        &self,
        lodge_id: &str,
        member_id: &str,
        record_id: Option<&str>,
        status: DiningStatus,
    ) -> ClientResult<DiningEntry> {
        let entry = MemberEntry::new(member_id, status);
        entry.validate().map_err(ClientError::Validation)?;

        match record_id {
            Some(record_id) => self.update_dining_status(record_id, status).await,
            None => self.create_dining_record(lodge_id, &entry).await,
        }
    }

    /// Send a queued mutation through the normal write path
    pub async fn replay(&self, mutation: &QueuedMutation) -> ClientResult<DiningEntry> {
        self.write_status(
            &mutation.lodge_id,
            &mutation.member_id,
            mutation.dining_record_id.as_deref(),
            mutation.new_status,
        )
        .await
    }

    pub async fn fetch_all_lodges(&self) -> ClientResult<Vec<Lodge>> {
        let records = self.backend.list(LODGES, &ListQuery::new()).await?;
        Ok(decode_all::<LodgeRecord>(records)?
            .into_iter()
            .map(Lodge::from)
            .collect())
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> ClientResult<T> {
    serde_json::from_value(value).map_err(|e| ClientError::InvalidResponse(e.to_string()))
}

fn decode_all<T: DeserializeOwned>(values: Vec<Value>) -> ClientResult<Vec<T>> {
    values.into_iter().map(decode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use serde_json::json;

    fn seeded() -> Arc<InMemoryBackend> {
        let backend = Arc::new(InMemoryBackend::new());
        for (id, first, last, status) in [
            ("mem_001", "Elias", "Wren", "active"),
            ("mem_002", "Thomas", "Ashmole", "honorary"),
            ("mem_003", "Robert", "Moray", "active"),
            ("mem_004", "John", "Byrom", "resigned"),
        ] {
            backend.insert(
                MEMBERS,
                json!({
                    "id": id, "lodge_id": "lodge_001", "first_name": first,
                    "last_name": last, "rank": "Bro.", "status": status
                }),
            );
        }
        backend.insert(
            MEMBERS,
            json!({
                "id": "mem_900", "lodge_id": "lodge_002", "first_name": "Other",
                "last_name": "Lodge", "rank": "", "status": "active"
            }),
        );
        backend.insert(
            DINING_RECORDS,
            json!({
                "id": "din_001", "lodge_id": "lodge_001", "member_id": "mem_002",
                "meeting_date": "2026-02-14T19:00:00.000Z", "status": "not_dining",
                "updated_by": "secretary"
            }),
        );
        backend
    }

    #[tokio::test]
    async fn test_dashboard_merges_roster_and_dining() {
        let repo = DiningRepository::new(seeded());
        let rows = repo.fetch_dining_dashboard("lodge_001").await.unwrap();

        let ids: Vec<&str> = rows.iter().map(|r| r.member_id.as_str()).collect();
        assert_eq!(ids, ["mem_002", "mem_003", "mem_001"]);

        assert_eq!(rows[0].dining_record_id.as_deref(), Some("din_001"));
        assert_eq!(rows[0].status, DiningStatus::NotDining);
        assert_eq!(rows[1].dining_record_id, None);
        assert_eq!(rows[1].status, DiningStatus::Undecided);
    }

    #[tokio::test]
    async fn test_create_sets_meeting_date_and_author() {
        let backend = seeded();
        backend.push_next_id("din_099");
        let repo = DiningRepository::new(backend.clone());

        let entry = repo
            .create_dining_record(
                "lodge_001",
                &MemberEntry::new("mem_003", DiningStatus::Dining),
            )
            .await
            .unwrap();

        assert_eq!(entry.id, "din_099");
        assert_eq!(entry.updated_by, UPDATED_BY);
        assert!(chrono::DateTime::parse_from_rfc3339(&entry.meeting_date).is_ok());
    }

    #[tokio::test]
    async fn test_replay_dispatches_update_or_create() {
        let backend = seeded();
        let repo = DiningRepository::new(backend.clone());

        let update = QueuedMutation {
            id: 1,
            member_id: "mem_002".to_string(),
            dining_record_id: Some("din_001".to_string()),
            lodge_id: "lodge_001".to_string(),
            new_status: DiningStatus::Dining,
            queued_at: "2026-02-14T19:00:00.000Z".to_string(),
        };
        let entry = repo.replay(&update).await.unwrap();
        assert_eq!(entry.id, "din_001");
        assert_eq!(entry.status, DiningStatus::Dining);

        let create = QueuedMutation {
            id: 2,
            member_id: "mem_003".to_string(),
            dining_record_id: None,
            ..update
        };
        repo.replay(&create).await.unwrap();

        let writes = backend.writes();
        assert_eq!(writes[0].id.as_deref(), Some("din_001"));
        assert_eq!(writes[1].id, None);
    }

    #[tokio::test]
    async fn test_empty_member_id_rejected_before_write() {
        let backend = seeded();
        let repo = DiningRepository::new(backend.clone());

        let err = repo
            .write_status("lodge_001", "  ", None, DiningStatus::Dining)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(msg) if msg == "Member identifier is required"));
        assert_eq!(backend.write_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_all_lodges() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert(
            LODGES,
            json!({ "id": "lodge_001", "name": "Lodge of Antiquity", "province": "London" }),
        );
        let repo = DiningRepository::new(backend);

        let lodges = repo.fetch_all_lodges().await.unwrap();
        assert_eq!(lodges.len(), 1);
        assert_eq!(lodges[0].meeting_location, "");
    }
}
