//! Active session registry: live sessions, participants, write arbitration, chat.

pub mod chat;
pub mod handle;
pub mod manager;
pub mod record;

pub use chat::{ChatBuffer, CHAT_BUFFER_CAPACITY};
pub use handle::SessionHandle;
pub use manager::ActiveSessionRegistry;
pub use record::{
    AccessMode, ActiveSessionChatMessage, ActiveSessionParticipant, ActiveSessionRecord,
    ClosedSession, ListActiveOptions, NewChatMessage, NewParticipant, ParticipantRole,
    SessionRegistration,
};
