//! Per-session recording pipeline.
//!
//! Each context owns a bounded queue and one dedicated consumer thread.
//! Producers enqueue captured chunks; the consumer encodes them and writes
//! them through `BufWriter → GzEncoder → HashingWriter → store object`.
//! A full queue makes the producer wait instead of dropping bytes.
//!
//! Stopping is a one-shot latch: tripping it drops the context's sender, the
//! consumer drains whatever is still queued, finishes the gzip stream and
//! returns a [`StreamSummary`] through its join handle.

use super::format::{elapsed_seconds, write_event, write_header, HashingWriter, RecordingHeader, StreamKind};
use super::store::RecordingStore;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tether_core::{TetherError, TetherResult};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error};

/// Capacity of each context's event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

const WRITE_BUFFER_SIZE: usize = 32 * 1024;

type Pipeline = BufWriter<GzEncoder<HashingWriter<Box<dyn Write + Send>>>>;

/// One captured chunk waiting for the consumer.
#[derive(Debug)]
pub struct QueuedEvent {
    pub at: DateTime<Utc>,
    pub stream: StreamKind,
    pub payload: Vec<u8>,
}

/// What the consumer thread reports once the stream is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    /// Hex SHA-256 of the compressed bytes.
    pub checksum: String,
    pub compressed_bytes: u64,
    pub payload_bytes: u64,
    pub events: u64,
}

/// Counters shared between producers, the consumer and status queries.
#[derive(Debug, Default)]
struct Progress {
    events_written: AtomicU64,
    payload_bytes: AtomicU64,
}

/// Everything a context needs to know about its session.
#[derive(Debug, Clone)]
pub struct ContextSpec {
    pub session_id: String,
    pub connection_id: String,
    pub protocol_id: String,
    pub owner_user_id: String,
    pub team_id: Option<String>,
    pub created_by: String,
    pub started_at: DateTime<Utc>,
    pub width: u16,
    pub height: u16,
    pub term: String,
    pub storage_kind: String,
    /// Retention captured from the policy when the session started.
    pub retention_days: u32,
    pub consent_required: bool,
}

/// Live counters of a context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub session_id: String,
    pub path: String,
    pub started_at: DateTime<Utc>,
    pub events_written: u64,
    pub bytes_written: u64,
}

/// A session being recorded.
pub struct RecordingContext {
    spec: ContextSpec,
    path: String,
    sender: Mutex<Option<mpsc::Sender<QueuedEvent>>>,
    consumer: Mutex<Option<JoinHandle<TetherResult<StreamSummary>>>>,
    stopped: AtomicBool,
    progress: Arc<Progress>,
}

impl RecordingContext {
    /// Allocate the store object, write the header and start the consumer.
    pub fn open(store: &dyn RecordingStore, spec: ContextSpec) -> TetherResult<Self> {
        let (path, writer) = store.create(&spec.session_id, &spec.protocol_id, spec.started_at)?;

        let mut pipeline: Pipeline = BufWriter::with_capacity(
            WRITE_BUFFER_SIZE,
            GzEncoder::new(HashingWriter::new(writer), Compression::default()),
        );
        let header = RecordingHeader::new(spec.width, spec.height, spec.started_at, &spec.term);
        write_header(&mut pipeline, &header)?;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let progress = Arc::new(Progress::default());
        let consumer_progress = progress.clone();
        let started_at = spec.started_at;
        let thread_session = spec.session_id.clone();

        let consumer = std::thread::Builder::new()
            .name(format!("recording-{}", short_id(&spec.session_id)))
            .spawn(move || consume(rx, pipeline, started_at, consumer_progress, &thread_session))?;

        debug!(session_id = %spec.session_id, path = %path, "recording context opened");
        Ok(Self {
            spec,
            path,
            sender: Mutex::new(Some(tx)),
            consumer: Mutex::new(Some(consumer)),
            stopped: AtomicBool::new(false),
            progress,
        })
    }

    pub fn spec(&self) -> &ContextSpec {
        &self.spec
    }

    pub fn session_id(&self) -> &str {
        &self.spec.session_id
    }

    /// Object path relative to the store root.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Queue an event, waiting for room when the queue is full.
    ///
    /// Returns `false` when the context was already stopped.
    pub async fn enqueue(&self, event: QueuedEvent) -> TetherResult<bool> {
        let Some(tx) = self.sender() else {
            return Ok(false);
        };

        match tx.try_send(event) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(event)) => {
                debug!(session_id = %self.spec.session_id, "recording queue full, waiting");
                tx.send(event)
                    .await
                    .map_err(|_| TetherError::Other("recording consumer has exited".into()))?;
                Ok(true)
            }
            Err(TrySendError::Closed(_)) => {
                Err(TetherError::Other("recording consumer has exited".into()))
            }
        }
    }

    /// Trip the stop latch. Only the first call returns `true`.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Producers still holding a clone finish their send first; the
        // consumer exits once every sender is gone.
        lock(&self.sender).take();
        true
    }

    /// Take the consumer's join handle. Returns `None` after the first call.
    pub fn take_consumer(&self) -> Option<JoinHandle<TetherResult<StreamSummary>>> {
        lock(&self.consumer).take()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            session_id: self.spec.session_id.clone(),
            path: self.path.clone(),
            started_at: self.spec.started_at,
            events_written: self.progress.events_written.load(Ordering::Relaxed),
            bytes_written: self.progress.payload_bytes.load(Ordering::Relaxed),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<QueuedEvent>> {
        lock(&self.sender).as_ref().cloned()
    }
}

impl Drop for RecordingContext {
    fn drop(&mut self) {
        // An abandoned context must not leave its consumer blocked forever.
        self.stop();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// Consumer loop. Runs on the context's dedicated thread.
fn consume(
    mut rx: mpsc::Receiver<QueuedEvent>,
    mut out: Pipeline,
    started_at: DateTime<Utc>,
    progress: Arc<Progress>,
    session_id: &str,
) -> TetherResult<StreamSummary> {
    let mut failure: Option<TetherError> = None;
    let mut last_elapsed = 0.0_f64;

    while let Some(event) = rx.blocking_recv() {
        if failure.is_some() {
            // Keep draining so producers never block on a dead pipeline.
            continue;
        }
        let elapsed = elapsed_seconds(started_at, event.at).max(last_elapsed);
        last_elapsed = elapsed;

        match write_event(&mut out, elapsed, event.stream, &event.payload) {
            Ok(()) => {
                progress.events_written.fetch_add(1, Ordering::Relaxed);
                progress
                    .payload_bytes
                    .fetch_add(event.payload.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                error!(session_id, error = %e, "recording write failed");
                failure = Some(e);
            }
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }

    let gz = out.into_inner().map_err(|e| e.into_error())?;
    let mut hashing = gz.finish()?;
    hashing.flush()?;
    let (writer, checksum, compressed_bytes) = hashing.finish();
    drop(writer);

    let summary = StreamSummary {
        checksum,
        compressed_bytes,
        payload_bytes: progress.payload_bytes.load(Ordering::Relaxed),
        events: progress.events_written.load(Ordering::Relaxed),
    };
    debug!(session_id, events = summary.events, bytes = summary.compressed_bytes, "recording stream closed");
    Ok(summary)
}
