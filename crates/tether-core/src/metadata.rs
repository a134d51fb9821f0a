//! Typed session metadata.
//!
//! Protocol drivers attach a small set of well-known keys to every session.
//! Anything else is carried verbatim in [`SessionMetadata::extra`] so newer
//! drivers can pass data through older services.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default terminal width when the driver does not report one.
pub const DEFAULT_TERMINAL_WIDTH: u16 = 80;
/// Default terminal height when the driver does not report one.
pub const DEFAULT_TERMINAL_HEIGHT: u16 = 24;
/// Default `TERM` value when the driver does not report one.
pub const DEFAULT_TERMINAL_TYPE: &str = "xterm-256color";

/// Metadata attached to a session by the protocol driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Per-session opt-in used when the recorder runs in optional mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_width: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_height: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_type: Option<String>,
    /// Unrecognized keys, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionMetadata {
    /// Terminal width, falling back to 80 columns for missing or zero values.
    pub fn width(&self) -> u16 {
        self.terminal_width
            .filter(|w| *w > 0)
            .unwrap_or(DEFAULT_TERMINAL_WIDTH)
    }

    /// Terminal height, falling back to 24 rows for missing or zero values.
    pub fn height(&self) -> u16 {
        self.terminal_height
            .filter(|h| *h > 0)
            .unwrap_or(DEFAULT_TERMINAL_HEIGHT)
    }

    /// `TERM` value, falling back to `xterm-256color`.
    pub fn term(&self) -> &str {
        self.terminal_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TERMINAL_TYPE)
    }

    /// Whether the session explicitly opted in to recording.
    pub fn recording_opt_in(&self) -> bool {
        self.recording_enabled == Some(true)
    }
}
