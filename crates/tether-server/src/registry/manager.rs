//! Active session registry.
//!
//! Tracks every live session, enforces one session per (user, connection)
//! and per-connection concurrency caps, arbitrates write access between
//! participants, relays chat, and evicts sessions that stop heartbeating.
//!
//! All mutations go through one coarse lock. Every read hands out a clone,
//! so callers never observe a half-applied change.

use super::chat::ChatBuffer;
use super::handle::{same_handle, SessionHandle};
use super::record::{
    AccessMode, ActiveSessionChatMessage, ActiveSessionParticipant, ActiveSessionRecord,
    ClosedSession, ListActiveOptions, NewChatMessage, NewParticipant, ParticipantRole,
    SessionRegistration,
};
use crate::metrics::Metrics;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    generate_id, publish_quietly, topics, ConcurrentLimitError, Event, EventHub, NoopHub,
    TetherError, TetherResult,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, ActiveSessionRecord>,
    /// (user_id, connection_id) → session id.
    by_user_connection: HashMap<(String, String), String>,
    /// connection_id → live session count.
    connection_counts: HashMap<String, u32>,
    handles: HashMap<String, Arc<dyn SessionHandle>>,
}

impl RegistryState {
    /// Remove a session and every index entry pointing at it.
    fn evict(
        &mut self,
        session_id: &str,
    ) -> Option<(ActiveSessionRecord, Option<Arc<dyn SessionHandle>>)> {
        let record = self.sessions.remove(session_id)?;

        let key = (record.user_id.clone(), record.connection_id.clone());
        if self.by_user_connection.get(&key).map(String::as_str) == Some(session_id) {
            self.by_user_connection.remove(&key);
        }

        if let Some(count) = self.connection_counts.get_mut(&record.connection_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.connection_counts.remove(&record.connection_id);
            }
        }

        let handle = self.handles.remove(session_id);
        Some((record, handle))
    }

    fn record_mut(&mut self, session_id: &str) -> TetherResult<&mut ActiveSessionRecord> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| TetherError::SessionNotFound(session_id.to_string()))
    }
}

/// Process-local directory of live sessions.
pub struct ActiveSessionRegistry {
    state: Arc<RwLock<RegistryState>>,
    hub: Arc<dyn EventHub>,
    metrics: Arc<Metrics>,
}

impl Default for ActiveSessionRegistry {
    fn default() -> Self {
        Self::new(Arc::new(NoopHub), Arc::new(Metrics::new()))
    }
}

impl ActiveSessionRegistry {
    /// Create an empty registry publishing to `hub`.
    pub fn new(hub: Arc<dyn EventHub>, metrics: Arc<Metrics>) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            hub,
            metrics,
        }
    }

    /// Register a new live session.
    ///
    /// The owner is added as the only participant, with write access.
    pub async fn register_session(
        &self,
        reg: SessionRegistration,
    ) -> TetherResult<ActiveSessionRecord> {
        validate_registration(&reg)?;

        let now = Utc::now();
        let started_at = reg.started_at.unwrap_or(now);
        let owner = reg
            .owner_user_id
            .filter(|o| !o.trim().is_empty())
            .unwrap_or_else(|| reg.user_id.clone());

        let mut participants = BTreeMap::new();
        participants.insert(
            owner.clone(),
            ActiveSessionParticipant {
                session_id: reg.id.clone(),
                user_id: owner.clone(),
                display_name: reg.owner_name.clone(),
                role: ParticipantRole::Owner,
                access_mode: AccessMode::Write,
                joined_at: started_at,
            },
        );

        let record = ActiveSessionRecord {
            id: reg.id,
            connection_id: reg.connection_id,
            user_id: reg.user_id,
            team_id: reg.team_id,
            protocol_id: reg.protocol_id,
            started_at,
            last_seen_at: reg.last_seen_at.unwrap_or(now),
            owner_user_id: owner.clone(),
            owner_name: reg.owner_name,
            concurrent_limit: reg.concurrent_limit,
            metadata: reg.metadata,
            participants,
            write_holder: Some(owner),
            chat: ChatBuffer::default(),
        };

        {
            let mut state = self.state.write().await;
            if state.sessions.contains_key(&record.id) {
                return Err(TetherError::DuplicateSession(record.id));
            }

            let key = (record.user_id.clone(), record.connection_id.clone());
            if let Some(existing) = state.by_user_connection.get(&key) {
                return Err(TetherError::AlreadyActive {
                    existing_id: existing.clone(),
                });
            }

            let live = state
                .connection_counts
                .get(&record.connection_id)
                .copied()
                .unwrap_or(0);
            if record.concurrent_limit > 0 && live >= record.concurrent_limit {
                return Err(ConcurrentLimitError {
                    connection_id: record.connection_id.clone(),
                    limit: record.concurrent_limit,
                    reason: format!("{live} session(s) already active on this connection"),
                }
                .into());
            }

            state.by_user_connection.insert(key, record.id.clone());
            *state
                .connection_counts
                .entry(record.connection_id.clone())
                .or_insert(0) += 1;
            state.sessions.insert(record.id.clone(), record.clone());
            self.metrics.set_active_sessions(state.sessions.len());
        }

        info!(
            session_id = %record.id,
            connection_id = %record.connection_id,
            user_id = %record.user_id,
            protocol = %record.protocol_id,
            "session registered"
        );
        self.publish(topics::SESSION_OPENED, &record.id, to_payload(&record));
        Ok(record)
    }

    /// Add or update a participant. Joining with write access demotes the
    /// current writer.
    pub async fn add_participant(
        &self,
        session_id: &str,
        new: NewParticipant,
    ) -> TetherResult<ActiveSessionParticipant> {
        if new.user_id.trim().is_empty() {
            return Err(TetherError::Validation("participant user_id is required".into()));
        }

        let participant = {
            let mut state = self.state.write().await;
            let record = state.record_mut(session_id)?;
            let existing = record.participants.get(&new.user_id);

            let participant = ActiveSessionParticipant {
                session_id: session_id.to_string(),
                user_id: new.user_id.clone(),
                display_name: new
                    .display_name
                    .or_else(|| existing.and_then(|p| p.display_name.clone())),
                role: new
                    .role
                    .or_else(|| existing.map(|p| p.role))
                    .unwrap_or_default(),
                access_mode: new.access_mode.unwrap_or_default(),
                joined_at: new
                    .joined_at
                    .or_else(|| existing.map(|p| p.joined_at))
                    .unwrap_or_else(Utc::now),
            };
            record
                .participants
                .insert(participant.user_id.clone(), participant.clone());

            if participant.access_mode == AccessMode::Write {
                record.set_sole_writer(&participant.user_id);
            } else if record.write_holder.as_deref() == Some(participant.user_id.as_str()) {
                // Re-joined as a reader: nobody writes until access is granted again.
                record.write_holder = None;
            }
            participant
        };

        debug!(session_id, user_id = %participant.user_id, access = ?participant.access_mode, "participant joined");
        self.publish(
            topics::SESSION_PARTICIPANT_JOINED,
            session_id,
            to_payload(&participant),
        );
        if participant.access_mode == AccessMode::Write {
            self.publish(
                topics::SESSION_WRITE_GRANTED,
                session_id,
                json!({ "user_id": participant.user_id }),
            );
        }
        Ok(participant)
    }

    /// Remove a participant. If they held write access it falls back to the
    /// owner, or is cleared when the owner is gone.
    ///
    /// Returns the new writer when write access changed hands.
    pub async fn remove_participant(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> TetherResult<Option<String>> {
        let new_writer = {
            let mut state = self.state.write().await;
            let record = state.record_mut(session_id)?;
            let removed = record.participants.remove(user_id).ok_or_else(|| {
                TetherError::ParticipantNotFound {
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                }
            })?;

            if record.write_holder.as_deref() == Some(user_id)
                || removed.access_mode == AccessMode::Write
            {
                record.fall_back_writer(user_id)
            } else {
                None
            }
        };

        debug!(session_id, user_id, new_writer = ?new_writer, "participant left");
        self.publish(
            topics::SESSION_PARTICIPANT_LEFT,
            session_id,
            json!({ "user_id": user_id }),
        );
        if let Some(writer) = &new_writer {
            self.publish(
                topics::SESSION_WRITE_GRANTED,
                session_id,
                json!({ "user_id": writer }),
            );
        }
        Ok(new_writer)
    }

    /// Make `user_id` the sole writer of the session.
    pub async fn grant_write_access(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> TetherResult<ActiveSessionParticipant> {
        let participant = {
            let mut state = self.state.write().await;
            let record = state.record_mut(session_id)?;
            if !record.participants.contains_key(user_id) {
                return Err(TetherError::ParticipantNotFound {
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                });
            }
            record.set_sole_writer(user_id);
            record.participants[user_id].clone()
        };

        info!(session_id, user_id, "write access granted");
        self.publish(
            topics::SESSION_WRITE_GRANTED,
            session_id,
            json!({ "user_id": user_id }),
        );
        Ok(participant)
    }

    /// Give up write access. A no-op unless `user_id` is the current writer.
    ///
    /// Returns the participant as it now stands and the new writer, if any.
    pub async fn relinquish_write_access(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> TetherResult<(ActiveSessionParticipant, Option<String>)> {
        let (participant, new_writer) = {
            let mut state = self.state.write().await;
            let record = state.record_mut(session_id)?;
            let current = record.participants.get(user_id).cloned().ok_or_else(|| {
                TetherError::ParticipantNotFound {
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                }
            })?;

            if record.write_holder.as_deref() != Some(user_id) {
                return Ok((current, None));
            }

            let new_writer = record.fall_back_writer(user_id);
            let updated = record.participants.get(user_id).cloned().unwrap_or(current);
            (updated, new_writer)
        };

        info!(session_id, user_id, new_writer = ?new_writer, "write access relinquished");
        self.publish(
            topics::SESSION_WRITE_GRANTED,
            session_id,
            json!({ "user_id": new_writer.clone().unwrap_or_default() }),
        );
        Ok((participant, new_writer))
    }

    /// Buffer a chat message for later persistence.
    pub async fn append_chat_message(
        &self,
        session_id: &str,
        new: NewChatMessage,
    ) -> TetherResult<ActiveSessionChatMessage> {
        if new.user_id.trim().is_empty() {
            return Err(TetherError::Validation("chat user_id is required".into()));
        }
        if new.body.trim().is_empty() {
            return Err(TetherError::Validation("chat body is empty".into()));
        }

        let message = ActiveSessionChatMessage {
            id: new.id.filter(|id| !id.is_empty()).unwrap_or_else(generate_id),
            session_id: session_id.to_string(),
            user_id: new.user_id,
            display_name: new.display_name,
            body: new.body,
            created_at: new.created_at.unwrap_or_else(Utc::now),
        };

        {
            let mut state = self.state.write().await;
            let record = state.record_mut(session_id)?;
            if let Some(dropped) = record.chat.push(message.clone()) {
                debug!(session_id, message_id = %dropped.id, "chat buffer full, dropped oldest message");
            }
        }

        self.publish(topics::SESSION_CHAT_POSTED, session_id, to_payload(&message));
        Ok(message)
    }

    /// Atomically take every buffered chat message, oldest first.
    pub async fn consume_chat_buffer(
        &self,
        session_id: &str,
    ) -> TetherResult<Vec<ActiveSessionChatMessage>> {
        let mut state = self.state.write().await;
        let record = state.record_mut(session_id)?;
        Ok(record.chat.drain())
    }

    /// Drop one buffered message after it was persisted. Returns whether it
    /// was still buffered.
    pub async fn ack_chat_message(&self, session_id: &str, message_id: &str) -> TetherResult<bool> {
        let mut state = self.state.write().await;
        let record = state.record_mut(session_id)?;
        Ok(record.chat.ack(message_id))
    }

    /// Evict a session. Returns its final state and any chat still buffered.
    pub async fn unregister_session(
        &self,
        session_id: &str,
        reason: &str,
    ) -> TetherResult<ClosedSession> {
        let (record, handle) = {
            let mut state = self.state.write().await;
            let evicted = state
                .evict(session_id)
                .ok_or_else(|| TetherError::SessionNotFound(session_id.to_string()))?;
            self.metrics.set_active_sessions(state.sessions.len());
            evicted
        };

        info!(session_id, reason, "session unregistered");
        Ok(self.finish_eviction(record, handle, reason))
    }

    /// Bump a session's last-seen timestamp.
    pub async fn heartbeat(&self, session_id: &str) -> TetherResult<()> {
        let mut state = self.state.write().await;
        let record = state.record_mut(session_id)?;
        record.last_seen_at = Utc::now();
        Ok(())
    }

    /// Evict sessions whose last heartbeat is older than `grace`.
    ///
    /// Nothing calls this on a timer; the host must invoke it periodically.
    pub async fn cleanup_stale(&self, grace: Duration) -> Vec<ClosedSession> {
        let Some(cutoff) = chrono::Duration::from_std(grace)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
        else {
            return Vec::new();
        };

        let evicted: Vec<_> = {
            let mut state = self.state.write().await;
            let stale: Vec<String> = state
                .sessions
                .values()
                .filter(|r| r.last_seen_at < cutoff)
                .map(|r| r.id.clone())
                .collect();
            let evicted: Vec<_> = stale.iter().filter_map(|id| state.evict(id)).collect();
            self.metrics.set_active_sessions(state.sessions.len());
            evicted
        };

        let closed: Vec<ClosedSession> = evicted
            .into_iter()
            .map(|(record, handle)| {
                warn!(session_id = %record.id, last_seen = %record.last_seen_at, "session evicted (stale)");
                self.finish_eviction(record, handle, "timeout")
            })
            .collect();

        if !closed.is_empty() {
            debug!(count = closed.len(), "stale sweep removed sessions");
        }
        closed
    }

    /// Associate a transport handle with a session, closing any different
    /// handle it replaces.
    pub async fn attach_handle(
        &self,
        session_id: &str,
        handle: Arc<dyn SessionHandle>,
    ) -> TetherResult<()> {
        let stale = {
            let mut state = self.state.write().await;
            if !state.sessions.contains_key(session_id) {
                return Err(TetherError::SessionNotFound(session_id.to_string()));
            }
            match state.handles.insert(session_id.to_string(), handle.clone()) {
                Some(old) if !same_handle(&old, &handle) => Some(old),
                _ => None,
            }
        };

        if let Some(old) = stale {
            debug!(session_id, "closing replaced session handle");
            old.close();
        }
        Ok(())
    }

    /// Detach and return the session's handle.
    pub async fn checkout_handle(&self, session_id: &str) -> Option<Arc<dyn SessionHandle>> {
        self.state.write().await.handles.remove(session_id)
    }

    /// The session's handle, left in place.
    pub async fn peek_handle(&self, session_id: &str) -> Option<Arc<dyn SessionHandle>> {
        self.state.read().await.handles.get(session_id).cloned()
    }

    /// Live sessions visible to the requester, most recently seen first.
    pub async fn list_active(&self, opts: &ListActiveOptions) -> Vec<ActiveSessionRecord> {
        let state = self.state.read().await;
        let mut sessions: Vec<ActiveSessionRecord> = state
            .sessions
            .values()
            .filter(|r| {
                opts.include_all
                    || r.visible_to(opts.requester_user_id.as_deref(), &opts.team_ids)
            })
            .filter(|r| {
                opts.connection_id
                    .as_deref()
                    .map_or(true, |c| r.connection_id == c)
            })
            .filter(|r| {
                opts.protocol_id
                    .as_deref()
                    .map_or(true, |p| r.protocol_id == p)
            })
            .cloned()
            .collect();
        drop(state);

        sessions.sort_by(|a, b| {
            b.last_seen_at
                .cmp(&a.last_seen_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
    }

    pub async fn get_session(&self, session_id: &str) -> TetherResult<ActiveSessionRecord> {
        self.state
            .read()
            .await
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| TetherError::SessionNotFound(session_id.to_string()))
    }

    /// The live session id for a (user, connection) pair, if any.
    pub async fn has_active_session(&self, user_id: &str, connection_id: &str) -> Option<String> {
        self.state
            .read()
            .await
            .by_user_connection
            .get(&(user_id.to_string(), connection_id.to_string()))
            .cloned()
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    /// Number of live sessions on one connection.
    pub async fn count_for_connection(&self, connection_id: &str) -> u32 {
        self.state
            .read()
            .await
            .connection_counts
            .get(connection_id)
            .copied()
            .unwrap_or(0)
    }

    fn finish_eviction(
        &self,
        mut record: ActiveSessionRecord,
        handle: Option<Arc<dyn SessionHandle>>,
        reason: &str,
    ) -> ClosedSession {
        if let Some(handle) = handle {
            handle.close();
        }
        let pending_chat = record.chat.drain();
        self.publish(topics::SESSION_CLOSED, &record.id, json!({ "reason": reason }));
        ClosedSession {
            record,
            pending_chat,
            reason: reason.to_string(),
        }
    }

    fn publish(&self, topic: &str, session_id: &str, payload: Value) {
        publish_quietly(self.hub.as_ref(), Event::new(topic, session_id, payload));
    }
}

fn validate_registration(reg: &SessionRegistration) -> TetherResult<()> {
    let required = [
        ("id", &reg.id),
        ("connection_id", &reg.connection_id),
        ("user_id", &reg.user_id),
        ("protocol_id", &reg.protocol_id),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(TetherError::Validation(format!("{field} is required")));
        }
    }
    Ok(())
}

fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tether_core::HubError;

    #[derive(Default)]
    struct CollectingHub {
        events: Mutex<Vec<Event>>,
    }

    impl CollectingHub {
        fn topics(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.topic.clone())
                .collect()
        }

        fn last(&self, topic: &str) -> Option<Event> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|e| e.topic == topic)
                .cloned()
        }
    }

    impl EventHub for CollectingHub {
        fn publish(&self, event: &Event) -> Result<(), HubError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct BrokenHub;

    impl EventHub for BrokenHub {
        fn publish(&self, _event: &Event) -> Result<(), HubError> {
            Err(HubError::Other("offline".into()))
        }
    }

    #[derive(Default)]
    struct TestHandle {
        closes: AtomicUsize,
    }

    impl SessionHandle for TestHandle {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn reg(id: &str, connection: &str, user: &str) -> SessionRegistration {
        SessionRegistration {
            id: id.into(),
            connection_id: connection.into(),
            user_id: user.into(),
            protocol_id: "ssh".into(),
            ..Default::default()
        }
    }

    fn registry() -> (ActiveSessionRegistry, Arc<CollectingHub>) {
        let hub = Arc::new(CollectingHub::default());
        (
            ActiveSessionRegistry::new(hub.clone(), Arc::new(Metrics::new())),
            hub,
        )
    }

    fn writers(record: &ActiveSessionRecord) -> Vec<String> {
        record
            .participants
            .values()
            .filter(|p| p.access_mode == AccessMode::Write)
            .map(|p| p.user_id.clone())
            .collect()
    }

    #[tokio::test]
    async fn owner_is_sole_writer_after_register() {
        let (registry, hub) = registry();
        let record = registry.register_session(reg("s1", "c1", "u1")).await.unwrap();

        assert_eq!(record.participants.len(), 1);
        let owner = record.participant("u1").unwrap();
        assert_eq!(owner.role, ParticipantRole::Owner);
        assert_eq!(owner.access_mode, AccessMode::Write);
        assert_eq!(record.write_holder.as_deref(), Some("u1"));
        assert_eq!(hub.topics(), vec![topics::SESSION_OPENED]);
    }

    #[tokio::test]
    async fn missing_fields_are_rejected_without_mutation() {
        let (registry, hub) = registry();
        let mut bad = reg("s1", "c1", "u1");
        bad.protocol_id.clear();
        let err = registry.register_session(bad).await.unwrap_err();
        assert!(matches!(err, TetherError::Validation(_)));
        assert_eq!(registry.count().await, 0);
        assert!(hub.topics().is_empty());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let (registry, _) = registry();
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();
        let err = registry
            .register_session(reg("s1", "c2", "u2"))
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::DuplicateSession(id) if id == "s1"));
    }

    #[tokio::test]
    async fn same_user_and_connection_is_already_active() {
        let (registry, _) = registry();
        let original = registry.register_session(reg("s1", "c1", "u1")).await.unwrap();

        let err = registry
            .register_session(reg("s2", "c1", "u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::AlreadyActive { existing_id } if existing_id == "s1"));

        let still = registry.get_session("s1").await.unwrap();
        assert_eq!(still.started_at, original.started_at);
        assert_eq!(still.participants, original.participants);
        assert_eq!(registry.count().await, 1);
        assert_eq!(registry.count_for_connection("c1").await, 1);
    }

    #[tokio::test]
    async fn concurrent_limit_blocks_second_session() {
        let (registry, _) = registry();
        let mut first = reg("s1", "c1", "u1");
        first.concurrent_limit = 1;
        registry.register_session(first).await.unwrap();

        let mut second = reg("s2", "c1", "u2");
        second.concurrent_limit = 1;
        let err = registry.register_session(second).await.unwrap_err();
        match err {
            TetherError::ConcurrentLimit(limit) => {
                assert_eq!(limit.connection_id, "c1");
                assert_eq!(limit.limit, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.count_for_connection("c1").await, 1);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn zero_limit_means_unlimited() {
        let (registry, _) = registry();
        for i in 0..5 {
            registry
                .register_session(reg(&format!("s{i}"), "c1", &format!("u{i}")))
                .await
                .unwrap();
        }
        assert_eq!(registry.count_for_connection("c1").await, 5);
    }

    #[tokio::test]
    async fn writer_join_demotes_owner() {
        let (registry, _) = registry();
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();

        let joined = registry
            .add_participant("s1", NewParticipant::writer("u2"))
            .await
            .unwrap();
        assert_eq!(joined.role, ParticipantRole::Participant);

        let record = registry.get_session("s1").await.unwrap();
        assert_eq!(writers(&record), vec!["u2"]);
        assert_eq!(record.write_holder.as_deref(), Some("u2"));
        assert_eq!(
            record.participant("u1").unwrap().access_mode,
            AccessMode::Read
        );
    }

    #[tokio::test]
    async fn reader_join_defaults() {
        let (registry, hub) = registry();
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();
        let p = registry
            .add_participant("s1", NewParticipant::reader("u2"))
            .await
            .unwrap();
        assert_eq!(p.access_mode, AccessMode::Read);
        assert_eq!(p.role, ParticipantRole::Participant);
        assert_eq!(
            registry.get_session("s1").await.unwrap().write_holder.as_deref(),
            Some("u1")
        );
        assert_eq!(
            hub.topics(),
            vec![topics::SESSION_OPENED, topics::SESSION_PARTICIPANT_JOINED]
        );
    }

    #[tokio::test]
    async fn removing_writer_returns_write_to_owner() {
        let (registry, hub) = registry();
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();
        registry
            .add_participant("s1", NewParticipant::writer("u2"))
            .await
            .unwrap();

        let new_writer = registry.remove_participant("s1", "u2").await.unwrap();
        assert_eq!(new_writer.as_deref(), Some("u1"));

        let record = registry.get_session("s1").await.unwrap();
        assert_eq!(writers(&record), vec!["u1"]);

        let topics_seen = hub.topics();
        let n = topics_seen.len();
        assert_eq!(
            &topics_seen[n - 2..],
            &[topics::SESSION_PARTICIPANT_LEFT, topics::SESSION_WRITE_GRANTED]
        );
        let granted = hub.last(topics::SESSION_WRITE_GRANTED).unwrap();
        assert_eq!(granted.payload["user_id"], "u1");
    }

    #[tokio::test]
    async fn removing_reader_leaves_writer_alone() {
        let (registry, _) = registry();
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();
        registry
            .add_participant("s1", NewParticipant::reader("u2"))
            .await
            .unwrap();
        assert_eq!(registry.remove_participant("s1", "u2").await.unwrap(), None);
        let record = registry.get_session("s1").await.unwrap();
        assert_eq!(record.write_holder.as_deref(), Some("u1"));

        let err = registry.remove_participant("s1", "u2").await.unwrap_err();
        assert!(matches!(err, TetherError::ParticipantNotFound { .. }));
    }

    #[tokio::test]
    async fn sequential_grants_leave_last_writer() {
        let (registry, _) = registry();
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();
        registry
            .add_participant("s1", NewParticipant::reader("x"))
            .await
            .unwrap();
        registry
            .add_participant("s1", NewParticipant::reader("y"))
            .await
            .unwrap();

        registry.grant_write_access("s1", "x").await.unwrap();
        registry.grant_write_access("s1", "y").await.unwrap();

        let record = registry.get_session("s1").await.unwrap();
        assert_eq!(writers(&record), vec!["y"]);
        assert_eq!(record.participant("x").unwrap().access_mode, AccessMode::Read);
        assert_eq!(record.write_holder.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn grant_to_absent_participant_fails() {
        let (registry, _) = registry();
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();
        let err = registry.grant_write_access("s1", "ghost").await.unwrap_err();
        assert!(matches!(err, TetherError::ParticipantNotFound { .. }));
    }

    #[tokio::test]
    async fn concurrent_grants_keep_single_writer() {
        let (registry, _) = registry();
        let registry = Arc::new(registry);
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();
        for i in 0..8 {
            registry
                .add_participant("s1", NewParticipant::reader(format!("p{i}")))
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.grant_write_access("s1", &format!("p{i}")).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let record = registry.get_session("s1").await.unwrap();
        let w = writers(&record);
        assert_eq!(w.len(), 1);
        assert_eq!(record.write_holder.as_ref(), w.first());
    }

    #[tokio::test]
    async fn relinquish_by_non_writer_is_noop() {
        let (registry, hub) = registry();
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();
        let before = registry
            .add_participant("s1", NewParticipant::reader("u2"))
            .await
            .unwrap();
        let events_before = hub.topics().len();

        let (participant, new_writer) = registry
            .relinquish_write_access("s1", "u2")
            .await
            .unwrap();
        assert_eq!(participant, before);
        assert_eq!(new_writer, None);
        assert_eq!(hub.topics().len(), events_before);
    }

    #[tokio::test]
    async fn relinquish_returns_write_to_owner_or_clears() {
        let (registry, hub) = registry();
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();
        registry
            .add_participant("s1", NewParticipant::writer("u2"))
            .await
            .unwrap();

        let (p, new_writer) = registry
            .relinquish_write_access("s1", "u2")
            .await
            .unwrap();
        assert_eq!(p.access_mode, AccessMode::Read);
        assert_eq!(new_writer.as_deref(), Some("u1"));

        let (owner, cleared) = registry
            .relinquish_write_access("s1", "u1")
            .await
            .unwrap();
        assert_eq!(owner.access_mode, AccessMode::Read);
        assert_eq!(cleared, None);
        let record = registry.get_session("s1").await.unwrap();
        assert!(writers(&record).is_empty());
        assert_eq!(record.write_holder, None);
        let granted = hub.last(topics::SESSION_WRITE_GRANTED).unwrap();
        assert_eq!(granted.payload["user_id"], "");
    }

    #[tokio::test]
    async fn chat_drains_in_order_and_caps_at_hundred() {
        let (registry, _) = registry();
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();

        for i in 0..105 {
            registry
                .append_chat_message(
                    "s1",
                    NewChatMessage {
                        id: Some(format!("m{i}")),
                        user_id: "u1".into(),
                        body: format!("hello {i}"),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let drained = registry.consume_chat_buffer("s1").await.unwrap();
        assert_eq!(drained.len(), 100);
        assert_eq!(drained.first().unwrap().id, "m5");
        assert_eq!(drained.last().unwrap().id, "m104");
        assert!(registry.consume_chat_buffer("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chat_ack_and_flush_on_unregister() {
        let (registry, _) = registry();
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();
        let a = registry
            .append_chat_message(
                "s1",
                NewChatMessage {
                    user_id: "u1".into(),
                    body: "first".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        registry
            .append_chat_message(
                "s1",
                NewChatMessage {
                    user_id: "u1".into(),
                    body: "second".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(registry.ack_chat_message("s1", &a.id).await.unwrap());
        assert!(!registry.ack_chat_message("s1", &a.id).await.unwrap());

        let closed = registry.unregister_session("s1", "closed").await.unwrap();
        assert_eq!(closed.pending_chat.len(), 1);
        assert_eq!(closed.pending_chat[0].body, "second");
        assert_eq!(registry.count().await, 0);
        assert_eq!(registry.count_for_connection("c1").await, 0);
        assert_eq!(registry.has_active_session("u1", "c1").await, None);
    }

    #[tokio::test]
    async fn empty_chat_is_rejected() {
        let (registry, _) = registry();
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();
        let err = registry
            .append_chat_message(
                "s1",
                NewChatMessage {
                    user_id: "u1".into(),
                    body: "   ".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Validation(_)));
    }

    #[tokio::test]
    async fn cleanup_stale_evicts_only_old_sessions() {
        let (registry, hub) = registry();
        let mut old = reg("old", "c1", "u1");
        old.last_seen_at = Some(Utc::now() - chrono::Duration::minutes(10));
        registry.register_session(old).await.unwrap();
        registry.register_session(reg("fresh", "c1", "u2")).await.unwrap();
        assert_eq!(registry.count_for_connection("c1").await, 2);

        let handle = Arc::new(TestHandle::default());
        registry.attach_handle("old", handle.clone()).await.unwrap();

        let closed = registry.cleanup_stale(Duration::from_secs(300)).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].record.id, "old");
        assert_eq!(closed[0].reason, "timeout");
        assert_eq!(handle.closes.load(Ordering::SeqCst), 1);

        assert_eq!(registry.count().await, 1);
        assert_eq!(registry.count_for_connection("c1").await, 1);
        assert_eq!(registry.has_active_session("u1", "c1").await, None);
        let closed_event = hub.last(topics::SESSION_CLOSED).unwrap();
        assert_eq!(closed_event.session_id, "old");
        assert_eq!(closed_event.payload["reason"], "timeout");

        // The freed pair can register again.
        registry.register_session(reg("again", "c1", "u1")).await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_removes_connection_counter_entirely() {
        let (registry, _) = registry();
        let mut old = reg("old", "c9", "u1");
        old.last_seen_at = Some(Utc::now() - chrono::Duration::hours(1));
        registry.register_session(old).await.unwrap();
        registry.cleanup_stale(Duration::from_secs(60)).await;
        assert_eq!(registry.count_for_connection("c9").await, 0);
        assert!(registry.state.read().await.connection_counts.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_keeps_session_alive() {
        let (registry, _) = registry();
        let mut r = reg("s1", "c1", "u1");
        r.last_seen_at = Some(Utc::now() - chrono::Duration::minutes(10));
        registry.register_session(r).await.unwrap();
        registry.heartbeat("s1").await.unwrap();
        assert!(registry
            .cleanup_stale(Duration::from_secs(60))
            .await
            .is_empty());
        assert!(registry.heartbeat("missing").await.is_err());
    }

    #[tokio::test]
    async fn attaching_new_handle_closes_stale_one() {
        let (registry, _) = registry();
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();

        let first = Arc::new(TestHandle::default());
        let second = Arc::new(TestHandle::default());
        registry.attach_handle("s1", first.clone()).await.unwrap();
        registry.attach_handle("s1", first.clone()).await.unwrap();
        assert_eq!(first.closes.load(Ordering::SeqCst), 0);

        registry.attach_handle("s1", second.clone()).await.unwrap();
        assert_eq!(first.closes.load(Ordering::SeqCst), 1);

        assert!(registry.peek_handle("s1").await.is_some());
        assert!(registry.checkout_handle("s1").await.is_some());
        assert!(registry.peek_handle("s1").await.is_none());
        assert_eq!(second.closes.load(Ordering::SeqCst), 0);

        let err = registry
            .attach_handle("nope", second.clone())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_active_scopes_and_sorts() {
        let (registry, _) = registry();
        let mut a = reg("a", "c1", "alice");
        a.last_seen_at = Some(Utc::now() - chrono::Duration::seconds(30));
        a.team_id = Some("ops".into());
        let mut b = reg("b", "c2", "bob");
        b.last_seen_at = Some(Utc::now() - chrono::Duration::seconds(10));
        let mut c = reg("c", "c3", "carol");
        c.last_seen_at = Some(Utc::now());
        registry.register_session(a).await.unwrap();
        registry.register_session(b).await.unwrap();
        registry.register_session(c).await.unwrap();
        registry
            .add_participant("b", NewParticipant::reader("alice"))
            .await
            .unwrap();

        let all = registry
            .list_active(&ListActiveOptions {
                include_all: true,
                ..Default::default()
            })
            .await;
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        let alice = registry
            .list_active(&ListActiveOptions {
                requester_user_id: Some("alice".into()),
                ..Default::default()
            })
            .await;
        let ids: Vec<_> = alice.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let ops = registry
            .list_active(&ListActiveOptions {
                requester_user_id: Some("dave".into()),
                team_ids: vec!["ops".into()],
                ..Default::default()
            })
            .await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].id, "a");
    }

    #[tokio::test]
    async fn reads_are_detached_copies() {
        let (registry, _) = registry();
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();
        let mut copy = registry.get_session("s1").await.unwrap();
        copy.participants.clear();
        copy.write_holder = None;
        let fresh = registry.get_session("s1").await.unwrap();
        assert_eq!(fresh.participants.len(), 1);
        assert_eq!(fresh.write_holder.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn hub_failures_do_not_fail_transitions() {
        let registry = ActiveSessionRegistry::new(Arc::new(BrokenHub), Arc::new(Metrics::new()));
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();
        registry
            .add_participant("s1", NewParticipant::writer("u2"))
            .await
            .unwrap();
        registry.unregister_session("s1", "closed").await.unwrap();
    }

    #[tokio::test]
    async fn gauge_tracks_active_sessions() {
        let metrics = Arc::new(Metrics::new());
        let registry = ActiveSessionRegistry::new(Arc::new(NoopHub), metrics.clone());
        registry.register_session(reg("s1", "c1", "u1")).await.unwrap();
        registry.register_session(reg("s2", "c1", "u2")).await.unwrap();
        assert_eq!(metrics.snapshot().active_sessions, 2);
        registry.unregister_session("s1", "closed").await.unwrap();
        assert_eq!(metrics.snapshot().active_sessions, 1);
    }
}
