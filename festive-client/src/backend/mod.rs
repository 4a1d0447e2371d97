//! Record storage backend
//!
//! The pipeline only needs two calls from the backend: a create/update
//! `write` and a full-list `list`. [`PocketBaseClient`] speaks the REST API;
//! [`crate::memory::InMemoryBackend`] is the in-process counterpart.
//! [`PocketBaseRealtime`] and [`HealthMonitor`] are the production signal
//! sources for the same server.

mod health;
mod http;
mod realtime;

pub use health::{HEALTH_CHECK_INTERVAL, HealthMonitor};
pub use http::PocketBaseClient;
pub use realtime::{PocketBaseRealtime, SseDecoder, SseMessage};

use async_trait::async_trait;
use serde_json::Value;

use crate::ClientResult;

/// Dining declarations
pub const DINING_RECORDS: &str = "dining_records";
/// Lodge roster
pub const MEMBERS: &str = "members";
pub const LODGES: &str = "lodges";

/// Filter and sort for a full-list fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Backend filter expression, e.g. `lodge_id = "lodge_001"`
    pub filter: Option<String>,
    /// Field to sort by; a leading `-` sorts descending
    pub sort: Option<String>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Equality filter on one field
    pub fn field_eq(mut self, field: &str, value: &str) -> Self {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        self.filter = Some(format!("{field} = \"{escaped}\""));
        self
    }

    pub fn sort(mut self, field: impl Into<String>) -> Self {
        self.sort = Some(field.into());
        self
    }
}

/// Record storage the client writes through
#[async_trait]
pub trait RecordBackend: Send + Sync + std::fmt::Debug {
    /// Create when `id` is `None`, otherwise update; returns the stored record
    async fn write(&self, collection: &str, id: Option<&str>, fields: Value)
    -> ClientResult<Value>;

    /// Every record of `collection` matching `query`
    async fn list(&self, collection: &str, query: &ListQuery) -> ClientResult<Vec<Value>>;
}
