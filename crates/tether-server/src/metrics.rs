//! Process-local counters for session and recording lifecycle events.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Shared counters, updated lock-free from the registry and recorder.
#[derive(Debug, Default)]
pub struct Metrics {
    recordings_started: AtomicU64,
    recordings_finished: AtomicU64,
    recordings_failed: AtomicU64,
    recordings_skipped: AtomicU64,
    recordings_expired: AtomicU64,
    bytes_recorded: AtomicU64,
    active_sessions: AtomicI64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub recordings_started: u64,
    pub recordings_finished: u64,
    pub recordings_failed: u64,
    pub recordings_skipped: u64,
    pub recordings_expired: u64,
    pub bytes_recorded: u64,
    pub active_sessions: i64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recording_started(&self) {
        self.recordings_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recording_finished(&self, bytes: u64) {
        self.recordings_finished.fetch_add(1, Ordering::Relaxed);
        self.bytes_recorded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn recording_failed(&self) {
        self.recordings_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recording_skipped(&self) {
        self.recordings_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recordings_expired(&self, count: usize) {
        self.recordings_expired
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Gauge: number of sessions currently in the registry.
    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.store(count as i64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            recordings_started: self.recordings_started.load(Ordering::Relaxed),
            recordings_finished: self.recordings_finished.load(Ordering::Relaxed),
            recordings_failed: self.recordings_failed.load(Ordering::Relaxed),
            recordings_skipped: self.recordings_skipped.load(Ordering::Relaxed),
            recordings_expired: self.recordings_expired.load(Ordering::Relaxed),
            bytes_recorded: self.bytes_recorded.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
        }
    }
}
