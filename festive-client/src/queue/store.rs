//! redb-backed durable queue of not-yet-delivered dining writes
//!
//! # Tables
//!
//! | Table | Key | Value | Purpose |
//! |-------|-----|-------|---------|
//! | `dining_mutations` | local id (`u64`) | `QueuedMutation` (JSON) | FIFO ledger |
//! | `dining_mutations_by_member` | `member_id` | local id | Collapsing lookup |
//! | `queue_meta` | `&str` | `u64` | Schema version + id sequence |
//!
//! Local ids are allocated from a monotonic sequence, so key order is
//! insertion order. At most one row per member exists at any time:
//! `enqueue` replaces the previous row inside the same write transaction.

use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
};
use serde::{Deserialize, Serialize};
use shared::models::DiningStatus;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Queue rows: key = local id, value = JSON-serialized QueuedMutation
const MUTATIONS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("dining_mutations");

/// Index: member_id -> local id
const BY_MEMBER_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("dining_mutations_by_member");

/// Metadata: schema version and id sequence
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("queue_meta");

const SCHEMA_VERSION_KEY: &str = "schema_version";
const NEXT_ID_KEY: &str = "next_id";

/// Current on-disk layout. Bump together with `migrate`.
pub const SCHEMA_VERSION: u64 = 1;

/// A dining write waiting for connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
    /// Local sequence number
    pub id: u64,
    pub member_id: String,
    /// `None` means the replay creates the record
    pub dining_record_id: Option<String>,
    pub lodge_id: String,
    pub new_status: DiningStatus,
    /// ISO-8601 UTC
    pub queued_at: String,
}

/// A mutation before it has been assigned a local id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMutation {
    pub member_id: String,
    pub dining_record_id: Option<String>,
    pub lodge_id: String,
    pub new_status: DiningStatus,
    pub queued_at: String,
}

impl NewMutation {
    pub fn new(
        lodge_id: impl Into<String>,
        member_id: impl Into<String>,
        dining_record_id: Option<String>,
        new_status: DiningStatus,
    ) -> Self {
        Self {
            member_id: member_id.into(),
            dining_record_id,
            lodge_id: lodge_id.into(),
            new_status,
            queued_at: shared::util::now_rfc3339(),
        }
    }

    fn into_queued(self, id: u64) -> QueuedMutation {
        QueuedMutation {
            id,
            member_id: self.member_id,
            dining_record_id: self.dining_record_id,
            lodge_id: self.lodge_id,
            new_status: self.new_status,
            queued_at: self.queued_at,
        }
    }
}

/// Queue storage errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u64, supported: u64 },
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Durable mutation queue
#[derive(Clone)]
pub struct MutationQueue {
    db: Arc<Database>,
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue").finish_non_exhaustive()
    }
}

impl MutationQueue {
    /// Open or create the queue database at the given path
    ///
    /// Commits are durable once `commit()` returns (redb default), so a
    /// queued edit survives a crash or reload right after `enqueue`.
    pub fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> QueueResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> QueueResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(MUTATIONS_TABLE)?;
            let _ = write_txn.open_table(BY_MEMBER_TABLE)?;
            let mut meta = write_txn.open_table(META_TABLE)?;

            let found = meta.get(SCHEMA_VERSION_KEY)?.map(|g| g.value());
            match found {
                None => {
                    meta.insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION)?;
                }
                Some(v) if v > SCHEMA_VERSION => {
                    return Err(QueueError::SchemaTooNew {
                        found: v,
                        supported: SCHEMA_VERSION,
                    });
                }
                Some(v) if v < SCHEMA_VERSION => {
                    migrate(v)?;
                    meta.insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION)?;
                    tracing::info!(from = v, to = SCHEMA_VERSION, "Migrated mutation queue schema");
                }
                Some(_) => {}
            }

            if meta.get(NEXT_ID_KEY)?.is_none() {
                meta.insert(NEXT_ID_KEY, 1u64)?;
            }
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Queue a mutation, replacing any queued mutation for the same member.
    ///
    /// Delete-old and insert-new happen in one write transaction. A record id
    /// carried by the replaced row is kept when the new one has none.
    pub fn enqueue(&self, mut mutation: NewMutation) -> QueueResult<QueuedMutation> {
        let txn = self.db.begin_write()?;
        let queued = {
            let mut rows = txn.open_table(MUTATIONS_TABLE)?;
            let mut by_member = txn.open_table(BY_MEMBER_TABLE)?;
            let mut meta = txn.open_table(META_TABLE)?;

            let existing = by_member
                .get(mutation.member_id.as_str())?
                .map(|g| g.value());
            if let Some(old_id) = existing {
                let replaced = rows
                    .remove(old_id)?
                    .map(|g| serde_json::from_slice::<QueuedMutation>(g.value()))
                    .transpose()?;
                if mutation.dining_record_id.is_none() {
                    mutation.dining_record_id = replaced.and_then(|m| m.dining_record_id);
                }
                tracing::debug!(
                    member_id = %mutation.member_id,
                    superseded = old_id,
                    "Collapsing queued mutation"
                );
            }

            let id = meta.get(NEXT_ID_KEY)?.map(|g| g.value()).unwrap_or(1);
            meta.insert(NEXT_ID_KEY, id + 1)?;

            let queued = mutation.into_queued(id);
            let value = serde_json::to_vec(&queued)?;
            rows.insert(id, value.as_slice())?;
            by_member.insert(queued.member_id.as_str(), id)?;
            queued
        };
        txn.commit()?;

        tracing::debug!(
            id = queued.id,
            member_id = %queued.member_id,
            status = %queued.new_status,
            "Mutation queued"
        );
        Ok(queued)
    }

    /// All queued mutations, oldest first.
    pub fn get_all(&self) -> QueueResult<Vec<QueuedMutation>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MUTATIONS_TABLE)?;

        let mut result = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let mutation = serde_json::from_slice::<QueuedMutation>(value.value()).inspect_err(|e| {
                tracing::error!(id = key.value(), error = %e, "Unreadable queued mutation");
            })?;
            result.push(mutation);
        }
        Ok(result)
    }

    /// One mutation by local id; `None` once delivered or superseded
    pub fn get(&self, id: u64) -> QueueResult<Option<QueuedMutation>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MUTATIONS_TABLE)?;
        let Some(value) = table.get(id)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(value.value())?))
    }

    /// Oldest mutation queued after local id `after` (from the start for `None`)
    pub fn next_after(&self, after: Option<u64>) -> QueueResult<Option<QueuedMutation>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MUTATIONS_TABLE)?;
        let start = after.map_or(0, |id| id + 1);
        let Some(entry) = table.range(start..)?.next() else {
            return Ok(None);
        };
        let (_, value) = entry?;
        Ok(Some(serde_json::from_slice(value.value())?))
    }

    /// Give the member's queued row a server record id it does not have yet.
    ///
    /// Returns whether a row was updated.
    pub fn adopt_record_id(&self, member_id: &str, record_id: &str) -> QueueResult<bool> {
        let txn = self.db.begin_write()?;
        let adopted = {
            let by_member = txn.open_table(BY_MEMBER_TABLE)?;
            let mut rows = txn.open_table(MUTATIONS_TABLE)?;

            let Some(id) = by_member.get(member_id)?.map(|g| g.value()) else {
                return Ok(false);
            };
            let queued = rows
                .get(id)?
                .map(|g| serde_json::from_slice::<QueuedMutation>(g.value()))
                .transpose()?;

            match queued {
                Some(mut queued) if queued.dining_record_id.is_none() => {
                    queued.dining_record_id = Some(record_id.to_string());
                    let value = serde_json::to_vec(&queued)?;
                    rows.insert(id, value.as_slice())?;
                    true
                }
                _ => false,
            }
        };
        txn.commit()?;
        Ok(adopted)
    }

    /// Remove one mutation by local id. No-op if it is gone already.
    ///
    /// Returns whether the row was still there.
    pub fn remove(&self, id: u64) -> QueueResult<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut rows = txn.open_table(MUTATIONS_TABLE)?;
            let removed = rows.remove(id)?.is_some();

            if removed {
                let mut by_member = txn.open_table(BY_MEMBER_TABLE)?;
                let mut stale = Vec::new();
                for entry in by_member.iter()? {
                    let (member_id, local_id) = entry?;
                    if local_id.value() == id {
                        stale.push(member_id.value().to_string());
                    }
                }
                for member_id in stale {
                    by_member.remove(member_id.as_str())?;
                }
            }
            removed
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Distinct member ids currently queued
    pub fn get_queued_member_ids(&self) -> QueueResult<HashSet<String>> {
        Ok(self
            .get_all()?
            .into_iter()
            .map(|m| m.member_id)
            .collect())
    }

    /// Number of queued mutations
    pub fn len(&self) -> QueueResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MUTATIONS_TABLE)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Empty the queue (reset/tests only)
    pub fn clear(&self) -> QueueResult<()> {
        let txn = self.db.begin_write()?;
        txn.delete_table(MUTATIONS_TABLE)?;
        txn.delete_table(BY_MEMBER_TABLE)?;
        {
            let _ = txn.open_table(MUTATIONS_TABLE)?;
            let _ = txn.open_table(BY_MEMBER_TABLE)?;
        }
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
impl MutationQueue {
    /// Replace the rows table with one of a different layout, so every
    /// later access to it fails the way a damaged store does
    pub(crate) fn break_storage(&self) -> QueueResult<()> {
        const WRONG_LAYOUT: TableDefinition<&str, &str> = TableDefinition::new("dining_mutations");

        let txn = self.db.begin_write()?;
        txn.delete_table(MUTATIONS_TABLE)?;
        {
            let _ = txn.open_table(WRONG_LAYOUT)?;
        }
        txn.commit()?;
        Ok(())
    }
}

/// Additive, in-place upgrades from older layouts.
///
/// Only v1 has shipped, so there is nothing to carry over yet.
fn migrate(from: u64) -> QueueResult<()> {
    tracing::debug!(from, "No queue migrations to apply");
    Ok(())
}
