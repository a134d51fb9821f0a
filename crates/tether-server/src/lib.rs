//! tether-server: live session registry and terminal recording pipeline.
//!
//! [`ActiveSessionRegistry`] tracks who is in which session, who may type,
//! and the chat side channel. [`Recorder`] captures terminal I/O of
//! sessions the policy selects into compressed recordings. [`TetherServer`]
//! wires both to one event hub and runs the periodic sweeps.

pub mod config;
pub mod metrics;
pub mod recording;
pub mod registry;
pub mod server;

pub use config::{Overrides, TetherConfig};
pub use metrics::{Metrics, MetricsSnapshot};
pub use recording::{
    FileRecordingStore, MemoryRecordingRepository, Recorder, RecorderPolicy, RecordingMode,
    RecordingQuery, RecordingRecord, RecordingRepository, RecordingStatus, RecordingStore,
    SessionStart, StreamKind,
};
pub use registry::{ActiveSessionRecord, ActiveSessionRegistry, SessionRegistration};
pub use server::{FinishedSession, OpenedSession, TetherServer};
