//! Offline mutation queue
//!
//! - [`store`]: durable redb ledger, the source of truth
//! - [`projection`]: in-memory queued/syncing sets for the UI
//! - [`processor`]: replays the ledger when connectivity returns

mod processor;
mod projection;
mod store;

pub use processor::{
    INITIAL_RETRY_DELAY, MAX_RETRY_ATTEMPTS, MAX_RETRY_DELAY, QueueProcessor, SyncReport,
};
pub use projection::{ProjectionState, QueueProjection};
pub use store::{
    MutationQueue, NewMutation, QueueError, QueueResult, QueuedMutation, SCHEMA_VERSION,
};
