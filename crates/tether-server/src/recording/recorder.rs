//! Recorder service.
//!
//! Decides per session whether to capture, owns the map of live
//! [`RecordingContext`]s, and turns finished streams into durable
//! [`RecordingRecord`]s. Also answers status and listing queries and runs
//! the retention sweep when asked to.
//!
//! The active map and the policy sit behind separate locks, so reading the
//! policy never waits on a recording being started or finalized.

use super::context::{ContextSpec, QueuedEvent, RecordingContext, StreamSummary};
use super::format::StreamKind;
use super::policy::{retention_deadline, RecorderPolicy};
use super::repository::{RecordingQuery, RecordingRecord, RecordingRepository};
use super::store::RecordingStore;
use crate::metrics::Metrics;
use crate::registry::ActiveSessionRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tether_core::{
    generate_id, publish_quietly, topics, CleanupError, Event, EventHub, SessionMetadata,
    TetherError, TetherResult,
};
use tracing::{debug, error, info, warn};

/// Session facts the recorder needs at start.
#[derive(Debug, Clone, Default)]
pub struct SessionStart {
    pub session_id: String,
    pub connection_id: String,
    pub protocol_id: String,
    pub owner_user_id: String,
    pub team_id: Option<String>,
    /// Defaults to the owner.
    pub created_by: Option<String>,
    /// Defaults to now.
    pub started_at: Option<DateTime<Utc>>,
    pub metadata: SessionMetadata,
}

impl From<&ActiveSessionRecord> for SessionStart {
    fn from(record: &ActiveSessionRecord) -> Self {
        Self {
            session_id: record.id.clone(),
            connection_id: record.connection_id.clone(),
            protocol_id: record.protocol_id.clone(),
            owner_user_id: record.owner_user_id.clone(),
            team_id: record.team_id.clone(),
            created_by: Some(record.user_id.clone()),
            started_at: Some(record.started_at),
            metadata: record.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Inactive,
    Recording,
    Completed,
}

/// Recording state of one session.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingStatus {
    pub session_id: String,
    pub state: RecordingState,
    pub active: bool,
    pub recording_id: Option<String>,
    pub storage_path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub events_written: u64,
    /// Payload bytes captured so far (live) or stored size (completed).
    pub bytes_written: u64,
    pub checksum: Option<String>,
    pub retention_until: Option<DateTime<Utc>>,
    pub consent_required: bool,
}

impl RecordingStatus {
    fn inactive(session_id: &str, consent_required: bool) -> Self {
        Self {
            session_id: session_id.to_string(),
            state: RecordingState::Inactive,
            active: false,
            recording_id: None,
            storage_path: None,
            started_at: None,
            ended_at: None,
            duration_ms: 0,
            events_written: 0,
            bytes_written: 0,
            checksum: None,
            retention_until: None,
            consent_required,
        }
    }

    fn live(ctx: &RecordingContext) -> Self {
        let snap = ctx.snapshot();
        let spec = ctx.spec();
        Self {
            session_id: snap.session_id,
            state: RecordingState::Recording,
            active: true,
            recording_id: None,
            storage_path: Some(snap.path),
            started_at: Some(snap.started_at),
            ended_at: None,
            duration_ms: duration_ms(snap.started_at, Utc::now()),
            events_written: snap.events_written,
            bytes_written: snap.bytes_written,
            checksum: None,
            retention_until: retention_deadline(spec.retention_days, spec.started_at),
            consent_required: spec.consent_required,
        }
    }

    fn completed(record: &RecordingRecord, consent_required: bool) -> Self {
        Self {
            session_id: record.session_id.clone(),
            state: RecordingState::Completed,
            active: false,
            recording_id: Some(record.id.clone()),
            storage_path: Some(record.storage_path.clone()),
            started_at: Some(record.started_at),
            ended_at: Some(record.ended_at),
            duration_ms: record.duration_ms,
            events_written: 0,
            bytes_written: record.size_bytes,
            checksum: Some(record.checksum.clone()),
            retention_until: record.retention_until,
            consent_required,
        }
    }
}

/// Policy engine plus registry of live recordings.
pub struct Recorder {
    store: Arc<dyn RecordingStore>,
    repository: Arc<dyn RecordingRepository>,
    hub: Arc<dyn EventHub>,
    metrics: Arc<Metrics>,
    policy: RwLock<RecorderPolicy>,
    active: Mutex<HashMap<String, Arc<RecordingContext>>>,
}

impl Recorder {
    pub fn new(
        store: Arc<dyn RecordingStore>,
        repository: Arc<dyn RecordingRepository>,
        hub: Arc<dyn EventHub>,
        metrics: Arc<Metrics>,
        policy: RecorderPolicy,
    ) -> TetherResult<Self> {
        check_policy(&policy, store.as_ref())?;
        Ok(Self {
            store,
            repository,
            hub,
            metrics,
            policy: RwLock::new(policy),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Current policy.
    pub fn policy(&self) -> RecorderPolicy {
        self.policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the policy. Sessions already recording keep the settings
    /// they started with.
    pub fn update_policy(&self, policy: RecorderPolicy) -> TetherResult<()> {
        check_policy(&policy, self.store.as_ref())?;
        info!(mode = %policy.mode, retention_days = policy.retention_days, "recording policy updated");
        *self
            .policy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = policy;
        Ok(())
    }

    /// Start recording a session if the policy says so.
    ///
    /// Returns `None` when the session is not recorded. Starting a session
    /// that is already recording returns its live status.
    pub fn on_session_started(&self, start: SessionStart) -> TetherResult<Option<RecordingStatus>> {
        let policy = self.policy();
        if !policy.should_record(&start.metadata) {
            debug!(session_id = %start.session_id, mode = %policy.mode, "session not recorded");
            self.metrics.recording_skipped();
            return Ok(None);
        }
        for (field, value) in [
            ("session_id", &start.session_id),
            ("protocol_id", &start.protocol_id),
        ] {
            if value.trim().is_empty() {
                return Err(TetherError::Validation(format!("{field} is required")));
            }
        }

        let spec = ContextSpec {
            session_id: start.session_id.clone(),
            connection_id: start.connection_id,
            protocol_id: start.protocol_id,
            created_by: start
                .created_by
                .unwrap_or_else(|| start.owner_user_id.clone()),
            owner_user_id: start.owner_user_id,
            team_id: start.team_id,
            started_at: start.started_at.unwrap_or_else(Utc::now),
            width: start.metadata.width(),
            height: start.metadata.height(),
            term: start.metadata.term().to_string(),
            storage_kind: policy.storage.clone(),
            retention_days: policy.retention_days,
            consent_required: policy.require_consent,
        };

        if let Some(existing) = self.lookup(&spec.session_id) {
            debug!(session_id = %spec.session_id, "session already recording");
            return Ok(Some(RecordingStatus::live(&existing)));
        }

        // Store I/O runs outside the map lock.
        let session_id = spec.session_id.clone();
        let ctx = match RecordingContext::open(self.store.as_ref(), spec) {
            Ok(ctx) => Arc::new(ctx),
            Err(e) => {
                // A concurrent start may have claimed the same object first.
                if let Some(winner) = self.lookup(&session_id) {
                    return Ok(Some(RecordingStatus::live(&winner)));
                }
                return Err(e);
            }
        };
        let status = {
            let mut active = self.active();
            match active.get(ctx.session_id()) {
                Some(winner) => Err(RecordingStatus::live(winner)),
                None => {
                    active.insert(ctx.session_id().to_string(), ctx.clone());
                    Ok(RecordingStatus::live(&ctx))
                }
            }
        };
        let status = match status {
            Ok(status) => status,
            Err(winner) => {
                debug!(session_id = %winner.session_id, "concurrent start lost, discarding duplicate context");
                self.discard(&ctx);
                return Ok(Some(winner));
            }
        };

        self.metrics.recording_started();
        info!(
            session_id = %status.session_id,
            path = status.storage_path.as_deref().unwrap_or_default(),
            "recording started"
        );
        publish_quietly(
            self.hub.as_ref(),
            Event::new(
                topics::RECORDING_STARTED,
                &status.session_id,
                json!({
                    "path": status.storage_path,
                    "consent_required": status.consent_required,
                }),
            ),
        );
        Ok(Some(status))
    }

    /// Capture a chunk of terminal I/O stamped with the current time.
    ///
    /// Silently ignored when the session is not being recorded.
    pub async fn record_stream(
        &self,
        session_id: &str,
        stream: StreamKind,
        payload: &[u8],
    ) -> TetherResult<()> {
        self.record_stream_at(session_id, stream, payload, Utc::now())
            .await
    }

    /// Capture a chunk of terminal I/O observed at `at`.
    pub async fn record_stream_at(
        &self,
        session_id: &str,
        stream: StreamKind,
        payload: &[u8],
        at: DateTime<Utc>,
    ) -> TetherResult<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let Some(ctx) = self.lookup(session_id) else {
            return Ok(());
        };
        ctx.enqueue(QueuedEvent {
            at,
            stream,
            payload: payload.to_vec(),
        })
        .await?;
        Ok(())
    }

    /// Stop and finalize a session's recording now.
    pub async fn stop_recording(&self, session_id: &str) -> TetherResult<Option<RecordingRecord>> {
        self.finalize(session_id, Utc::now()).await
    }

    /// Finalize a session's recording when the session ends. A no-op for
    /// sessions that were not recorded.
    pub async fn on_session_closed(
        &self,
        session_id: &str,
        ended_at: Option<DateTime<Utc>>,
    ) -> TetherResult<Option<RecordingRecord>> {
        self.finalize(session_id, ended_at.unwrap_or_else(Utc::now))
            .await
    }

    /// Recording state of a session: live, completed, or inactive.
    pub fn status(&self, session_id: &str) -> TetherResult<RecordingStatus> {
        if let Some(ctx) = self.lookup(session_id) {
            return Ok(RecordingStatus::live(&ctx));
        }
        let consent = self.policy().require_consent;
        match self.repository.find_by_session(session_id)? {
            Some(record) => Ok(RecordingStatus::completed(&record, consent)),
            None => Ok(RecordingStatus::inactive(session_id, consent)),
        }
    }

    /// Session ids currently being recorded.
    pub fn active_recordings(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn list_recordings(&self, query: &RecordingQuery) -> TetherResult<Vec<RecordingRecord>> {
        self.repository.list(query)
    }

    pub fn get_record(&self, recording_id: &str) -> TetherResult<RecordingRecord> {
        self.repository
            .get(recording_id)?
            .ok_or_else(|| TetherError::RecordingNotFound(recording_id.to_string()))
    }

    /// Stream the stored (compressed) artifact.
    pub fn open_recording(&self, recording_id: &str) -> TetherResult<Box<dyn Read + Send>> {
        let record = self.get_record(recording_id)?;
        self.store.open(&record.storage_path)
    }

    /// Delete a recording's artifact and row.
    pub fn delete_recording(&self, recording_id: &str) -> TetherResult<()> {
        let record = self.get_record(recording_id)?;
        self.store.delete(&record.storage_path)?;
        self.repository.delete(&record.id)?;
        info!(recording_id, session_id = %record.session_id, "recording deleted");
        Ok(())
    }

    /// Remove up to `limit` recordings past their retention deadline.
    ///
    /// Failures are collected and reported together; the batch always runs
    /// to completion. Nothing calls this on a timer.
    pub fn cleanup_expired(&self, limit: usize) -> TetherResult<usize> {
        self.cleanup_expired_at(Utc::now(), limit)
    }

    pub fn cleanup_expired_at(&self, now: DateTime<Utc>, limit: usize) -> TetherResult<usize> {
        if limit == 0 {
            return Ok(0);
        }
        let expired = self.repository.expired(now, limit)?;
        let mut failures = CleanupError::default();
        let mut removed = 0;

        for record in expired {
            if let Err(e) = self.store.delete(&record.storage_path) {
                warn!(recording_id = %record.id, error = %e, "failed to delete expired artifact");
                failures.push(&record.id, e.to_string());
                continue;
            }
            match self.repository.delete(&record.id) {
                Ok(_) => removed += 1,
                Err(e) => {
                    warn!(recording_id = %record.id, error = %e, "failed to delete expired row");
                    failures.push(&record.id, e.to_string());
                }
            }
        }

        self.metrics.recordings_expired(removed);
        if failures.is_empty() {
            if removed > 0 {
                info!(removed, "expired recordings removed");
            }
            Ok(removed)
        } else {
            failures.removed = removed;
            Err(failures.into())
        }
    }

    /// Finalize every live recording. Errors are logged, not returned.
    pub async fn shutdown(&self) -> usize {
        let ids = self.active_recordings();
        let mut finalized = 0;
        for id in ids {
            match self.stop_recording(&id).await {
                Ok(Some(_)) => finalized += 1,
                Ok(None) => {}
                Err(e) => error!(session_id = %id, error = %e, "failed to finalize recording on shutdown"),
            }
        }
        finalized
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, Arc<RecordingContext>>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(&self, session_id: &str) -> Option<Arc<RecordingContext>> {
        self.active().get(session_id).cloned()
    }

    /// Stop a context that never made it into the map and remove its object.
    fn discard(&self, ctx: &RecordingContext) {
        ctx.stop();
        if let Some(handle) = ctx.take_consumer() {
            if handle.join().is_err() {
                warn!(session_id = %ctx.session_id(), "discarded recording consumer panicked");
            }
        }
        if let Err(e) = self.store.delete(ctx.path()) {
            warn!(session_id = %ctx.session_id(), path = %ctx.path(), error = %e, "failed to delete discarded recording object");
        }
    }

    /// Remove the context and trip its stop latch in one step under the
    /// map lock, so only one caller ever finalizes it.
    fn detach(&self, session_id: &str) -> Option<Arc<RecordingContext>> {
        let mut active = self.active();
        let ctx = active.remove(session_id)?;
        ctx.stop();
        Some(ctx)
    }

    async fn finalize(
        &self,
        session_id: &str,
        ended_at: DateTime<Utc>,
    ) -> TetherResult<Option<RecordingRecord>> {
        let Some(ctx) = self.detach(session_id) else {
            return Ok(None);
        };

        match self.persist(&ctx, ended_at).await {
            Ok(record) => {
                self.metrics.recording_finished(record.size_bytes);
                info!(
                    session_id,
                    recording_id = %record.id,
                    size = record.size_bytes,
                    duration_ms = record.duration_ms,
                    "recording finalized"
                );
                publish_quietly(
                    self.hub.as_ref(),
                    Event::new(
                        topics::RECORDING_FINISHED,
                        session_id,
                        json!({
                            "recording_id": record.id,
                            "size_bytes": record.size_bytes,
                            "checksum": record.checksum,
                        }),
                    ),
                );
                Ok(Some(record))
            }
            Err(e) => {
                self.metrics.recording_failed();
                // The partial artifact stays behind for the retention sweep
                // or an operator.
                error!(session_id, path = %ctx.path(), error = %e, "recording finalize failed");
                publish_quietly(
                    self.hub.as_ref(),
                    Event::new(
                        topics::RECORDING_FAILED,
                        session_id,
                        json!({ "error": e.to_string() }),
                    ),
                );
                Err(e)
            }
        }
    }

    async fn persist(
        &self,
        ctx: &RecordingContext,
        ended_at: DateTime<Utc>,
    ) -> TetherResult<RecordingRecord> {
        let summary = self.await_consumer(ctx).await?;
        let info = self.store.stat(ctx.path())?;
        let spec = ctx.spec();

        if info.size != summary.compressed_bytes {
            warn!(
                session_id = %spec.session_id,
                stored = info.size,
                written = summary.compressed_bytes,
                "stored size differs from bytes written"
            );
        }

        let ended_at = ended_at.max(spec.started_at);
        let record = RecordingRecord {
            id: generate_id(),
            session_id: spec.session_id.clone(),
            connection_id: spec.connection_id.clone(),
            protocol_id: spec.protocol_id.clone(),
            owner_user_id: spec.owner_user_id.clone(),
            team_id: spec.team_id.clone(),
            created_by: spec.created_by.clone(),
            storage_kind: spec.storage_kind.clone(),
            storage_path: ctx.path().to_string(),
            size_bytes: info.size,
            duration_ms: duration_ms(spec.started_at, ended_at),
            checksum: summary.checksum,
            started_at: spec.started_at,
            ended_at,
            created_at: Utc::now(),
            retention_until: retention_deadline(spec.retention_days, spec.started_at),
        };
        self.repository.insert(record.clone())?;
        Ok(record)
    }

    async fn await_consumer(&self, ctx: &RecordingContext) -> TetherResult<StreamSummary> {
        let handle = ctx
            .take_consumer()
            .ok_or_else(|| TetherError::Other("recording consumer already joined".into()))?;
        tokio::task::spawn_blocking(move || handle.join())
            .await
            .map_err(|e| TetherError::Other(format!("finalize task failed: {e}")))?
            .map_err(|_| TetherError::Other("recording consumer panicked".into()))?
    }
}

fn check_policy(policy: &RecorderPolicy, store: &dyn RecordingStore) -> TetherResult<()> {
    policy.validate()?;
    if policy.storage != store.kind() {
        return Err(TetherError::Validation(format!(
            "storage {:?} is not configured (available: {:?})",
            policy.storage,
            store.kind()
        )));
    }
    Ok(())
}

fn duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}
