//! tether-core: shared vocabulary for the tether session services.
//!
//! Provides the error taxonomy, the typed session metadata model, the
//! fire-and-forget event hub contract, and identifier generation.

pub mod error;
pub mod events;
pub mod ids;
pub mod metadata;

// Re-export commonly used items at crate root.
pub use error::{CleanupError, ConcurrentLimitError, TetherError, TetherResult};
pub use events::{publish_quietly, topics, BroadcastHub, Event, EventHub, HubError, NoopHub};
pub use ids::generate_id;
pub use metadata::SessionMetadata;
