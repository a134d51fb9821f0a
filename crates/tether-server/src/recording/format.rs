//! On-disk recording format.
//!
//! A recording is gzip-compressed, newline-delimited JSON. The first line is
//! a header; every following line is one terminal event:
//!
//! ```text
//! {"version":2,"width":80,"height":24,"timestamp":1700000000,"env":{"TERM":"xterm-256color"}}
//! [0.25,"o","$ "]
//! [1.5,"i","ls\r"]
//! ```
//!
//! The checksum is SHA-256 over the compressed bytes exactly as stored.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{self, BufRead, BufReader, Read, Write};
use tether_core::{TetherError, TetherResult};
use tracing::warn;

pub const FORMAT_VERSION: u32 = 2;

/// Direction of a captured chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    /// Bytes typed by a participant.
    #[serde(rename = "i")]
    Input,
    /// Bytes produced by the remote end.
    #[serde(rename = "o")]
    Output,
}

impl StreamKind {
    pub fn code(self) -> &'static str {
        match self {
            StreamKind::Input => "i",
            StreamKind::Output => "o",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEnv {
    #[serde(rename = "TERM")]
    pub term: String,
}

/// First line of every recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingHeader {
    pub version: u32,
    pub width: u16,
    pub height: u16,
    /// Unix seconds of the session start.
    pub timestamp: i64,
    pub env: HeaderEnv,
}

impl RecordingHeader {
    pub fn new(width: u16, height: u16, started_at: DateTime<Utc>, term: &str) -> Self {
        Self {
            version: FORMAT_VERSION,
            width,
            height,
            timestamp: started_at.timestamp(),
            env: HeaderEnv {
                term: term.to_string(),
            },
        }
    }
}

/// A decoded event line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent(pub f64, pub StreamKind, pub String);

impl RecordedEvent {
    pub fn elapsed(&self) -> f64 {
        self.0
    }

    pub fn stream(&self) -> StreamKind {
        self.1
    }

    pub fn payload(&self) -> &str {
        &self.2
    }
}

/// Seconds between `start` and `at`, clamped to zero.
pub fn elapsed_seconds(start: DateTime<Utc>, at: DateTime<Utc>) -> f64 {
    let delta = at - start;
    let secs = match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    };
    secs.max(0.0)
}

/// Write the header line.
pub fn write_header<W: Write>(out: &mut W, header: &RecordingHeader) -> TetherResult<()> {
    serde_json::to_writer(&mut *out, header)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Write one event line. Payload bytes are decoded as lossy UTF-8.
///
/// Elapsed time is always written as a JSON float, so whole seconds come
/// out as `2.0`, never `2`.
pub fn write_event<W: Write>(
    out: &mut W,
    elapsed: f64,
    stream: StreamKind,
    payload: &[u8],
) -> TetherResult<()> {
    let text = String::from_utf8_lossy(payload);
    serde_json::to_writer(&mut *out, &(elapsed, stream.code(), text.as_ref()))?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Writer that hashes and counts everything passing through it.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Consume the writer, returning the inner writer, the hex digest and
    /// the byte count.
    pub fn finish(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.bytes)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hex SHA-256 of everything `reader` yields.
pub fn checksum_of<R: Read>(mut reader: R) -> TetherResult<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Decode a compressed recording into its header and events.
///
/// Malformed event lines are logged and skipped.
pub fn read_recording<R: Read>(reader: R) -> TetherResult<(RecordingHeader, Vec<RecordedEvent>)> {
    let mut lines = BufReader::new(GzDecoder::new(reader)).lines();

    let header_line = lines
        .next()
        .ok_or_else(|| TetherError::Validation("recording has no header".into()))??;
    let header: RecordingHeader = serde_json::from_str(&header_line)?;

    let mut events = Vec::new();
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RecordedEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(error = %e, "skipping malformed recording line");
            }
        }
    }
    Ok((header, events))
}
