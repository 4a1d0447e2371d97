//! Festive Client - offline-resilient dining dashboard client
//!
//! Secretaries mark members as dining / not dining / undecided. Edits are
//! applied to the local read-cache at once, written through when the
//! backend is reachable and otherwise kept in a durable queue that is
//! replayed, in order, when the connection returns.

pub mod backend;
pub mod cache;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod logger;
pub mod memory;
pub mod mutation;
pub mod queue;
pub mod realtime;
pub mod repository;
pub mod transport;
pub mod view;

pub use backend::{HealthMonitor, ListQuery, PocketBaseClient, PocketBaseRealtime, RecordBackend};
pub use cache::{DashboardCache, DashboardQuery, QueryEntry, Rollback};
pub use config::ClientConfig;
pub use connection::{ConnectionMonitor, ConnectionStatus, ConnectionStore, StatusTransition};
pub use engine::SyncEngine;
pub use error::{ClientError, ClientResult};
pub use events::ClientEvent;
pub use mutation::{DiningMutation, ToggleOutcome};
pub use queue::{
    MutationQueue, NewMutation, QueueError, QueueProcessor, QueueProjection, QueuedMutation,
    SyncReport,
};
pub use realtime::RealtimeSync;
pub use repository::DiningRepository;
pub use transport::{HostEvent, HostNetwork, RealtimeTransport, RecordEvent, Subscription};
pub use view::{DashboardRow, RowIndicator};

// Re-export shared types for convenience
pub use shared::models::{DiningEntry, DiningStatus, DiningTableRow};
