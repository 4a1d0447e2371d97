//! Shared types for the Festive Board dining dashboard
//!
//! Backend record shapes, domain types and the mappers between them,
//! shared by the client library and its tooling.

pub mod models;
pub mod util;

// Re-exports
pub use serde::{Deserialize, Serialize};

pub use models::{
    DiningEntry, DiningRecord, DiningStatus, DiningTableRow, Lodge, LodgeRecord, Member,
    MemberEntry, MemberRecord, MemberStatus, merge_members_with_dining,
};
