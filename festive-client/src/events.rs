//! User-visible notifications

use serde::{Deserialize, Serialize};

/// Notification emitted by the client for the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// A queue flush delivered `count` deferred edits
    QueueSynced { count: usize },
}

impl ClientEvent {
    /// Toast text
    pub fn message(&self) -> String {
        match self {
            ClientEvent::QueueSynced { count } => {
                let noun = if *count == 1 { "change" } else { "changes" };
                format!("Synced {count} {noun} to the Festive Board")
            }
        }
    }
}
