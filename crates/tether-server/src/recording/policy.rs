//! Recording policy: whether, where and for how long sessions are captured.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tether_core::{SessionMetadata, TetherError, TetherResult};

/// Global capture directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingMode {
    /// Never record.
    Disabled,
    /// Record sessions that opt in through `recording_enabled`.
    #[default]
    Optional,
    /// Record every session.
    Forced,
}

impl fmt::Display for RecordingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordingMode::Disabled => "disabled",
            RecordingMode::Optional => "optional",
            RecordingMode::Forced => "forced",
        })
    }
}

impl FromStr for RecordingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(RecordingMode::Disabled),
            "optional" => Ok(RecordingMode::Optional),
            "forced" | "always" => Ok(RecordingMode::Forced),
            other => Err(format!(
                "unknown recording mode {other:?} (expected disabled, optional or forced)"
            )),
        }
    }
}

/// Runtime-mutable recorder settings. Changes apply to sessions started
/// after the update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderPolicy {
    pub mode: RecordingMode,
    /// Storage tag; must name the configured store.
    pub storage: String,
    /// Days to keep recordings; 0 keeps them forever.
    pub retention_days: u32,
    /// Surface a consent prompt to participants of recorded sessions.
    pub require_consent: bool,
}

impl Default for RecorderPolicy {
    fn default() -> Self {
        Self {
            mode: RecordingMode::default(),
            storage: "local".to_string(),
            retention_days: 0,
            require_consent: false,
        }
    }
}

impl RecorderPolicy {
    /// Decide once, at session start, whether to capture.
    pub fn should_record(&self, metadata: &SessionMetadata) -> bool {
        match self.mode {
            RecordingMode::Disabled => false,
            RecordingMode::Forced => true,
            RecordingMode::Optional => metadata.recording_opt_in(),
        }
    }

    pub fn validate(&self) -> TetherResult<()> {
        if self.storage.trim().is_empty() {
            return Err(TetherError::Validation("policy storage tag is required".into()));
        }
        Ok(())
    }
}

/// Retention deadline for a recording started at `started_at`.
pub fn retention_deadline(retention_days: u32, started_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if retention_days == 0 {
        return None;
    }
    started_at.checked_add_signed(Duration::days(i64::from(retention_days)))
}
