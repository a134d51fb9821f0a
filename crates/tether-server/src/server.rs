//! Host wiring: builds the registry and recorder from config, keeps their
//! lifecycles in step, and runs the periodic maintenance sweeps.

use crate::config::TetherConfig;
use crate::metrics::Metrics;
use crate::recording::{
    FileRecordingStore, MemoryRecordingRepository, Recorder, RecordingRecord,
    RecordingRepository, RecordingStatus, SessionStart,
};
use crate::registry::{ActiveSessionRecord, ActiveSessionRegistry, ClosedSession, SessionRegistration};
use std::sync::Arc;
use tether_core::{BroadcastHub, Event, EventHub, TetherError, TetherResult};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Close reason the registry uses for sessions evicted by the stale sweep.
const STALE_REASON: &str = "timeout";

/// A freshly opened session together with its recording state.
#[derive(Debug, Clone)]
pub struct OpenedSession {
    pub record: ActiveSessionRecord,
    pub recording: Option<RecordingStatus>,
}

/// A closed session together with its finalized recording, if any.
#[derive(Debug, Clone)]
pub struct FinishedSession {
    pub closed: ClosedSession,
    pub recording: Option<RecordingRecord>,
}

/// The tether instance: one registry, one recorder, one event hub.
pub struct TetherServer {
    config: TetherConfig,
    hub: Arc<BroadcastHub>,
    metrics: Arc<Metrics>,
    registry: ActiveSessionRegistry,
    recorder: Recorder,
}

impl TetherServer {
    /// Build an instance with a local file store and an in-memory
    /// recording repository.
    pub fn new(config: TetherConfig) -> TetherResult<Self> {
        Self::with_repository(config, Arc::new(MemoryRecordingRepository::new()))
    }

    pub fn with_repository(
        config: TetherConfig,
        repository: Arc<dyn RecordingRepository>,
    ) -> TetherResult<Self> {
        std::fs::create_dir_all(&config.recording_root)?;
        let hub = Arc::new(BroadcastHub::default());
        let metrics = Arc::new(Metrics::new());
        let events: Arc<dyn EventHub> = hub.clone();

        let registry = ActiveSessionRegistry::new(events.clone(), metrics.clone());
        let recorder = Recorder::new(
            Arc::new(FileRecordingStore::new(&config.recording_root)),
            repository,
            events,
            metrics.clone(),
            config.policy.clone(),
        )?;

        info!(
            root = %config.recording_root.display(),
            mode = %config.policy.mode,
            retention_days = config.policy.retention_days,
            "tether initialized"
        );
        Ok(Self {
            config,
            hub,
            metrics,
            registry,
            recorder,
        })
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    pub fn registry(&self) -> &ActiveSessionRegistry {
        &self.registry
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Receive every lifecycle event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.hub.subscribe()
    }

    /// Register a session and start recording it if the policy says so.
    ///
    /// A recording that fails to start is logged; the session stays open.
    pub async fn open_session(&self, reg: SessionRegistration) -> TetherResult<OpenedSession> {
        let record = self.registry.register_session(reg).await?;
        let recording = match self.recorder.on_session_started(SessionStart::from(&record)) {
            Ok(status) => status,
            Err(e) => {
                error!(session_id = %record.id, error = %e, "failed to start recording");
                None
            }
        };
        Ok(OpenedSession { record, recording })
    }

    /// Unregister a session and finalize its recording.
    pub async fn close_session(&self, session_id: &str, reason: &str) -> TetherResult<FinishedSession> {
        let closed = self.registry.unregister_session(session_id, reason).await?;
        let recording = self.finalize(&closed).await;
        Ok(FinishedSession { closed, recording })
    }

    /// Evict stale sessions and finalize their recordings.
    pub async fn sweep_once(&self) -> Vec<FinishedSession> {
        let closed = self.registry.cleanup_stale(self.config.stale_grace).await;
        let mut finished = Vec::with_capacity(closed.len());
        for session in closed {
            let recording = self.finalize(&session).await;
            finished.push(FinishedSession {
                closed: session,
                recording,
            });
        }
        if !finished.is_empty() {
            debug!(count = finished.len(), "stale sweep finished");
        }
        finished
    }

    /// Run one retention pass. Returns how many recordings were removed.
    pub fn cleanup_recordings(&self) -> usize {
        match self.recorder.cleanup_expired(self.config.cleanup_batch) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "retention sweep incomplete");
                match e {
                    TetherError::Cleanup(c) => c.removed,
                    _ => 0,
                }
            }
        }
    }

    /// Spawn the stale-session and retention loops. They run until aborted.
    pub fn spawn_maintenance(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let sweeper = {
            let server = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(server.config.sweep_interval);
                loop {
                    interval.tick().await;
                    server.sweep_once().await;
                }
            })
        };
        let janitor = {
            let server = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(server.config.cleanup_interval);
                loop {
                    interval.tick().await;
                    server.cleanup_recordings();
                }
            })
        };
        vec![sweeper, janitor]
    }

    /// Finalize every live recording before exit.
    pub async fn shutdown(&self) {
        let finalized = self.recorder.shutdown().await;
        info!(finalized, active_sessions = self.registry.count().await, "tether stopped");
    }

    async fn finalize(&self, closed: &ClosedSession) -> Option<RecordingRecord> {
        // A stale session ended when it was last heard from.
        let ended_at = if closed.reason == STALE_REASON {
            closed.record.last_seen_at
        } else {
            chrono::Utc::now()
        };
        match self
            .recorder
            .on_session_closed(&closed.record.id, Some(ended_at))
            .await
        {
            Ok(record) => record,
            Err(e) => {
                error!(session_id = %closed.record.id, error = %e, "failed to finalize recording");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{RecordingMode, RecordingQuery, StreamKind};
    use std::time::Duration;
    use tether_core::{topics, SessionMetadata};

    fn server(mode: RecordingMode, dir: &tempfile::TempDir) -> TetherServer {
        let mut config = TetherConfig::default();
        config.recording_root = dir.path().join("recordings");
        config.policy.mode = mode;
        TetherServer::new(config).unwrap()
    }

    fn registration(id: &str) -> SessionRegistration {
        SessionRegistration {
            id: id.into(),
            connection_id: "c1".into(),
            user_id: "alice".into(),
            protocol_id: "ssh".into(),
            metadata: SessionMetadata {
                recording_enabled: Some(true),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn open_and_close_keep_registry_and_recorder_in_step() {
        let dir = tempfile::tempdir().unwrap();
        let srv = server(RecordingMode::Optional, &dir);
        let mut events = srv.subscribe();

        let opened = srv.open_session(registration("s1")).await.unwrap();
        assert!(opened.recording.unwrap().active);
        assert_eq!(srv.registry().count().await, 1);

        srv.recorder()
            .record_stream("s1", StreamKind::Output, b"hello\r\n")
            .await
            .unwrap();

        let finished = srv.close_session("s1", "client_exit").await.unwrap();
        assert_eq!(finished.closed.reason, "client_exit");
        let recording = finished.recording.unwrap();
        assert_eq!(recording.session_id, "s1");
        assert_eq!(srv.registry().count().await, 0);
        assert!(srv.recorder().active_recordings().is_empty());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.topic);
        }
        for topic in [
            topics::SESSION_OPENED,
            topics::RECORDING_STARTED,
            topics::SESSION_CLOSED,
            topics::RECORDING_FINISHED,
        ] {
            assert!(seen.iter().any(|t| t == topic), "missing {topic}");
        }
    }

    #[tokio::test]
    async fn stale_sweep_finalizes_recordings() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TetherConfig::default();
        config.recording_root = dir.path().to_path_buf();
        config.policy.mode = RecordingMode::Forced;
        config.stale_grace = Duration::from_secs(60);
        let srv = TetherServer::new(config).unwrap();

        let mut reg = registration("old");
        reg.last_seen_at = Some(chrono::Utc::now() - chrono::Duration::minutes(10));
        srv.open_session(reg).await.unwrap();
        let mut fresh = registration("fresh");
        fresh.user_id = "bob".into();
        srv.open_session(fresh).await.unwrap();

        let finished = srv.sweep_once().await;
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].closed.record.id, "old");
        assert!(finished[0].recording.is_some());
        assert_eq!(srv.recorder().active_recordings(), vec!["fresh"]);

        srv.shutdown().await;
        assert!(srv.recorder().active_recordings().is_empty());
        let rows = srv
            .recorder()
            .list_recordings(&RecordingQuery::all())
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn disabled_mode_opens_sessions_without_recording() {
        let dir = tempfile::tempdir().unwrap();
        let srv = server(RecordingMode::Disabled, &dir);
        let opened = srv.open_session(registration("s1")).await.unwrap();
        assert!(opened.recording.is_none());
        let finished = srv.close_session("s1", "done").await.unwrap();
        assert!(finished.recording.is_none());
        assert_eq!(srv.metrics().snapshot().recordings_skipped, 1);
        assert_eq!(srv.cleanup_recordings(), 0);
    }
}
