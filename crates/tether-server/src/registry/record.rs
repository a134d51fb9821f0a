//! Data carried by the active session registry.

use super::chat::ChatBuffer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tether_core::SessionMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Owner,
    #[default]
    Participant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Read,
    Write,
}

/// A user attached to a live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSessionParticipant {
    pub session_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub role: ParticipantRole,
    pub access_mode: AccessMode,
    pub joined_at: DateTime<Utc>,
}

/// Input to [`add_participant`](super::ActiveSessionRegistry::add_participant).
///
/// Unset fields default to a read-only participant joining now.
#[derive(Debug, Clone, Default)]
pub struct NewParticipant {
    pub user_id: String,
    pub display_name: Option<String>,
    pub role: Option<ParticipantRole>,
    pub access_mode: Option<AccessMode>,
    pub joined_at: Option<DateTime<Utc>>,
}

impl NewParticipant {
    pub fn reader(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn writer(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_mode: Some(AccessMode::Write),
            ..Default::default()
        }
    }
}

/// A chat line waiting to be persisted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSessionChatMessage {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Input to [`append_chat_message`](super::ActiveSessionRegistry::append_chat_message).
#[derive(Debug, Clone, Default)]
pub struct NewChatMessage {
    /// Generated when absent.
    pub id: Option<String>,
    pub user_id: String,
    pub display_name: Option<String>,
    pub body: String,
    /// Defaults to now.
    pub created_at: Option<DateTime<Utc>>,
}

/// Input to [`register_session`](super::ActiveSessionRegistry::register_session).
#[derive(Debug, Clone, Default)]
pub struct SessionRegistration {
    pub id: String,
    pub connection_id: String,
    pub user_id: String,
    pub team_id: Option<String>,
    pub protocol_id: String,
    /// Defaults to `user_id`.
    pub owner_user_id: Option<String>,
    pub owner_name: Option<String>,
    /// Maximum live sessions on the connection; 0 means unlimited.
    pub concurrent_limit: u32,
    pub metadata: SessionMetadata,
    pub started_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// In-memory state of one live session.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSessionRecord {
    pub id: String,
    pub connection_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub protocol_id: String,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub owner_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
    pub concurrent_limit: u32,
    pub metadata: SessionMetadata,
    pub participants: BTreeMap<String, ActiveSessionParticipant>,
    pub write_holder: Option<String>,
    #[serde(skip)]
    pub chat: ChatBuffer,
}

impl ActiveSessionRecord {
    pub fn participant(&self, user_id: &str) -> Option<&ActiveSessionParticipant> {
        self.participants.get(user_id)
    }

    /// Whether `user_id` owns, participates in, or shares a team with the session.
    pub fn visible_to(&self, user_id: Option<&str>, team_ids: &[String]) -> bool {
        if let Some(uid) = user_id {
            if self.user_id == uid || self.owner_user_id == uid || self.participants.contains_key(uid)
            {
                return true;
            }
        }
        match &self.team_id {
            Some(team) => team_ids.iter().any(|t| t == team),
            None => false,
        }
    }

    /// Make `user_id` the only participant with write access.
    ///
    /// Callers must ensure the participant exists.
    pub(crate) fn set_sole_writer(&mut self, user_id: &str) {
        for (uid, participant) in self.participants.iter_mut() {
            participant.access_mode = if uid == user_id {
                AccessMode::Write
            } else {
                AccessMode::Read
            };
        }
        self.write_holder = Some(user_id.to_string());
    }

    /// Hand write access back to the owner when they are present and not
    /// `leaving`, otherwise clear it. Returns the new writer.
    pub(crate) fn fall_back_writer(&mut self, leaving: &str) -> Option<String> {
        let owner = self.owner_user_id.clone();
        if owner != leaving && self.participants.contains_key(&owner) {
            self.set_sole_writer(&owner);
            Some(owner)
        } else {
            for participant in self.participants.values_mut() {
                participant.access_mode = AccessMode::Read;
            }
            self.write_holder = None;
            None
        }
    }
}

/// Result of evicting a session: the final record and its undelivered chat.
#[derive(Debug, Clone)]
pub struct ClosedSession {
    pub record: ActiveSessionRecord,
    pub pending_chat: Vec<ActiveSessionChatMessage>,
    pub reason: String,
}

/// Filters for [`list_active`](super::ActiveSessionRegistry::list_active).
#[derive(Debug, Clone, Default)]
pub struct ListActiveOptions {
    pub requester_user_id: Option<String>,
    pub team_ids: Vec<String>,
    /// Ignore requester scoping (administrative view).
    pub include_all: bool,
    pub connection_id: Option<String>,
    pub protocol_id: Option<String>,
}
