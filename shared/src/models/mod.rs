//! Data models
//!
//! `*Record` types mirror backend collection rows (snake_case on the wire);
//! the plain types are what the client consumes.
//! All IDs are backend-assigned strings.

pub mod dining;
pub mod lodge;
pub mod member;

// Re-exports
pub use dining::*;
pub use lodge::*;
pub use member::*;
