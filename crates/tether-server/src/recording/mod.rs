//! Recording pipeline: policy, on-disk format, storage, metadata rows and
//! the recorder service that ties them together.

pub mod context;
pub mod format;
pub mod policy;
pub mod recorder;
pub mod repository;
pub mod store;

pub use context::{ContextSnapshot, RecordingContext, StreamSummary, EVENT_QUEUE_CAPACITY};
pub use format::{read_recording, RecordedEvent, RecordingHeader, StreamKind, FORMAT_VERSION};
pub use policy::{retention_deadline, RecorderPolicy, RecordingMode};
pub use recorder::{Recorder, RecordingState, RecordingStatus, SessionStart};
pub use repository::{
    MemoryRecordingRepository, RecordingQuery, RecordingRecord, RecordingRepository,
    RecordingScope, RecordingSort, MAX_PAGE_SIZE,
};
pub use store::{FileRecordingStore, ObjectInfo, RecordingStore};
