//! Object storage for recording artifacts.
//!
//! Artifacts are addressed by a relative path chosen at creation time. The
//! filesystem store partitions them by protocol and month:
//!
//! ```text
//! <root>/<protocol>/<yyyy>/<mm>/<session>-<unix>.cast.gz
//! ```
//!
//! Every fragment derived from caller-supplied identifiers is sanitized
//! before it reaches the filesystem, and paths handed back to `open`,
//! `stat` and `delete` must stay inside the root.

use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tether_core::{TetherError, TetherResult};
use tracing::debug;

/// File extension of stored recordings.
pub const RECORDING_EXTENSION: &str = "cast.gz";

const MAX_FRAGMENT_LEN: usize = 64;

/// Size and modification time of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Byte-addressable storage for recording artifacts.
pub trait RecordingStore: Send + Sync {
    /// Storage tag written into recording records (e.g. `local`).
    fn kind(&self) -> &str;

    /// Allocate a new writable object. Returns its relative path and writer.
    fn create(
        &self,
        session_id: &str,
        protocol_id: &str,
        started_at: DateTime<Utc>,
    ) -> TetherResult<(String, Box<dyn Write + Send>)>;

    fn open(&self, path: &str) -> TetherResult<Box<dyn Read + Send>>;

    fn stat(&self, path: &str) -> TetherResult<ObjectInfo>;

    /// Remove an object. Removing a missing object succeeds.
    fn delete(&self, path: &str) -> TetherResult<()>;
}

/// Filesystem-backed [`RecordingStore`].
#[derive(Debug, Clone)]
pub struct FileRecordingStore {
    root: PathBuf,
}

impl FileRecordingStore {
    pub const KIND: &'static str = "local";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a relative object path to an absolute one under the root.
    fn resolve(&self, path: &str) -> TetherResult<PathBuf> {
        let rel = Path::new(path);
        if path.is_empty()
            || !rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(TetherError::Validation(format!(
                "invalid recording path: {path:?}"
            )));
        }
        Ok(self.root.join(rel))
    }
}

impl RecordingStore for FileRecordingStore {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn create(
        &self,
        session_id: &str,
        protocol_id: &str,
        started_at: DateTime<Utc>,
    ) -> TetherResult<(String, Box<dyn Write + Send>)> {
        let rel = object_path(session_id, protocol_id, started_at);
        let full = self.resolve(&rel)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => {
                    TetherError::Store(format!("recording object already exists: {rel}"))
                }
                _ => TetherError::Io(e),
            })?;

        debug!(path = %full.display(), "recording object created");
        Ok((rel, Box::new(file)))
    }

    fn open(&self, path: &str) -> TetherResult<Box<dyn Read + Send>> {
        let full = self.resolve(path)?;
        let file = fs::File::open(&full).map_err(|e| not_found_or_io(e, path))?;
        Ok(Box::new(file))
    }

    fn stat(&self, path: &str) -> TetherResult<ObjectInfo> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full).map_err(|e| not_found_or_io(e, path))?;
        Ok(ObjectInfo {
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    fn delete(&self, path: &str) -> TetherResult<()> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full) {
            Ok(()) => {
                debug!(path = %full.display(), "recording object deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn not_found_or_io(e: io::Error, path: &str) -> TetherError {
    if e.kind() == io::ErrorKind::NotFound {
        TetherError::RecordingNotFound(path.to_string())
    } else {
        TetherError::Io(e)
    }
}

/// Relative object path for a session's recording.
pub fn object_path(session_id: &str, protocol_id: &str, started_at: DateTime<Utc>) -> String {
    format!(
        "{}/{}/{}/{}-{}.{}",
        sanitize_fragment(protocol_id),
        started_at.format("%Y"),
        started_at.format("%m"),
        sanitize_fragment(session_id),
        started_at.timestamp(),
        RECORDING_EXTENSION,
    )
}

/// Reduce an untrusted identifier to `[a-z0-9_-]`.
///
/// Traversal sequences are removed, other characters become `-`, and an
/// empty result becomes `unknown`.
pub fn sanitize_fragment(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase().replace("..", "");
    let mapped: String = lowered
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_FRAGMENT_LEN)
        .collect();
    let trimmed = mapped.trim_matches(|c| c == '-' || c == '_');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap()
    }

    #[test]
    fn sanitize_strips_traversal_and_case() {
        assert_eq!(sanitize_fragment("SSH"), "ssh");
        assert_eq!(sanitize_fragment("../../etc/passwd"), "etc-passwd");
        assert_eq!(sanitize_fragment("a b/c"), "a-b-c");
        assert_eq!(sanitize_fragment(""), "unknown");
        assert_eq!(sanitize_fragment(".."), "unknown");
        assert_eq!(sanitize_fragment("sess_01-AB"), "sess_01-ab");
        assert_eq!(sanitize_fragment(&"x".repeat(200)).len(), 64);
    }

    #[test]
    fn object_path_is_partitioned() {
        let path = object_path("S1", "RDP", at());
        assert_eq!(path, format!("rdp/2024/03/s1-{}.cast.gz", at().timestamp()));
    }

    #[test]
    fn create_stat_open_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordingStore::new(dir.path());

        let (path, mut writer) = store.create("s1", "ssh", at()).unwrap();
        writer.write_all(b"hello").unwrap();
        drop(writer);

        assert!(dir.path().join(&path).exists());
        assert_eq!(store.stat(&path).unwrap().size, 5);

        let mut buf = String::new();
        store.open(&path).unwrap().read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "hello");

        store.delete(&path).unwrap();
        store.delete(&path).unwrap();
        assert!(matches!(
            store.stat(&path),
            Err(TetherError::RecordingNotFound(_))
        ));
    }

    #[test]
    fn create_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordingStore::new(dir.path());
        let (_path, _w) = store.create("s1", "ssh", at()).unwrap();
        let err = store.create("s1", "ssh", at()).err().unwrap();
        assert!(matches!(err, TetherError::Store(_)));
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordingStore::new(dir.path());
        for bad in ["../outside", "/etc/passwd", "", "a/../../b"] {
            assert!(
                matches!(store.stat(bad), Err(TetherError::Validation(_))),
                "{bad} should be rejected"
            );
        }
    }
}
