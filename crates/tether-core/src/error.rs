use thiserror::Error;

/// A connection already hosts as many live sessions as it allows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("connection {connection_id} reached its concurrent session limit of {limit}: {reason}")]
pub struct ConcurrentLimitError {
    pub connection_id: String,
    pub limit: u32,
    pub reason: String,
}

/// Failures collected while sweeping a batch of expired recordings.
///
/// The sweep keeps going after an item fails; every failure ends up here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("{} recording(s) failed to clean up: {}", .failures.len(), summarize(.failures))]
pub struct CleanupError {
    /// Recordings removed before and after the failures.
    pub removed: usize,
    /// `(recording_id, message)` for every item that failed.
    pub failures: Vec<(String, String)>,
}

impl CleanupError {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn push(&mut self, recording_id: impl Into<String>, message: impl Into<String>) {
        self.failures.push((recording_id.into(), message.into()));
    }
}

fn summarize(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(id, msg)| format!("{id}: {msg}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors produced by the registry, recorder and recording store.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("session already registered: {0}")]
    DuplicateSession(String),

    #[error("user already has an active session on this connection: {existing_id}")]
    AlreadyActive { existing_id: String },

    #[error(transparent)]
    ConcurrentLimit(#[from] ConcurrentLimitError),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("participant {user_id} not found in session {session_id}")]
    ParticipantNotFound { session_id: String, user_id: String },

    #[error("recording not found: {0}")]
    RecordingNotFound(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("repository error: {0}")]
    Repository(String),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error("{0}")]
    Other(String),
}

impl TetherError {
    /// Whether this error is one of the registration conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            TetherError::DuplicateSession(_)
                | TetherError::AlreadyActive { .. }
                | TetherError::ConcurrentLimit(_)
        )
    }

    /// Whether this error reports a missing session, participant or recording.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TetherError::SessionNotFound(_)
                | TetherError::ParticipantNotFound { .. }
                | TetherError::RecordingNotFound(_)
        )
    }
}

pub type TetherResult<T> = Result<T, TetherError>;
