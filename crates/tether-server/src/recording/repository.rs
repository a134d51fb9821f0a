//! Durable recording rows.
//!
//! [`RecordingRepository`] is the seam to the relational layer. The
//! in-memory implementation keeps rows behind a mutex, which also plays the
//! role of the row lock held while a recording is finalized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tether_core::{TetherError, TetherResult};

/// Maximum rows returned by one listing page.
pub const MAX_PAGE_SIZE: usize = 100;

/// A finalized recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingRecord {
    pub id: String,
    pub session_id: String,
    pub connection_id: String,
    pub protocol_id: String,
    pub owner_user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub created_by: String,
    pub storage_kind: String,
    pub storage_path: String,
    pub size_bytes: u64,
    pub duration_ms: u64,
    /// Hex SHA-256 of the stored bytes.
    pub checksum: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_until: Option<DateTime<Utc>>,
}

/// Which recordings a requester may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingScope {
    /// Recordings the user owns or created.
    Personal { user_id: String },
    /// Recordings belonging to any of the teams.
    Team { team_ids: Vec<String> },
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingSort {
    #[default]
    Newest,
    Oldest,
    SizeAsc,
    SizeDesc,
}

/// Listing filters. `limit` is clamped to `1..=100`, 0 meaning 100.
#[derive(Debug, Clone)]
pub struct RecordingQuery {
    pub scope: RecordingScope,
    pub protocol_id: Option<String>,
    pub connection_id: Option<String>,
    pub session_id: Option<String>,
    pub owner_user_id: Option<String>,
    pub created_by: Option<String>,
    pub sort: RecordingSort,
    pub limit: usize,
    pub offset: usize,
}

impl RecordingQuery {
    pub fn new(scope: RecordingScope) -> Self {
        Self {
            scope,
            protocol_id: None,
            connection_id: None,
            session_id: None,
            owner_user_id: None,
            created_by: None,
            sort: RecordingSort::default(),
            limit: MAX_PAGE_SIZE,
            offset: 0,
        }
    }

    pub fn all() -> Self {
        Self::new(RecordingScope::All)
    }

    pub fn personal(user_id: impl Into<String>) -> Self {
        Self::new(RecordingScope::Personal {
            user_id: user_id.into(),
        })
    }

    pub fn team(team_ids: Vec<String>) -> Self {
        Self::new(RecordingScope::Team { team_ids })
    }

    pub fn page_size(&self) -> usize {
        match self.limit {
            0 => MAX_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        }
    }

    pub fn matches(&self, record: &RecordingRecord) -> bool {
        let in_scope = match &self.scope {
            RecordingScope::All => true,
            RecordingScope::Personal { user_id } => {
                &record.owner_user_id == user_id || &record.created_by == user_id
            }
            RecordingScope::Team { team_ids } => record
                .team_id
                .as_ref()
                .is_some_and(|t| team_ids.contains(t)),
        };
        in_scope
            && eq_filter(&self.protocol_id, &record.protocol_id)
            && eq_filter(&self.connection_id, &record.connection_id)
            && eq_filter(&self.session_id, &record.session_id)
            && eq_filter(&self.owner_user_id, &record.owner_user_id)
            && eq_filter(&self.created_by, &record.created_by)
    }

    /// Filter, sort and page an iterator of rows.
    pub fn apply<'a>(&self, rows: impl Iterator<Item = &'a RecordingRecord>) -> Vec<RecordingRecord> {
        let mut selected: Vec<RecordingRecord> = rows.filter(|r| self.matches(r)).cloned().collect();
        selected.sort_by(|a, b| {
            let primary = match self.sort {
                RecordingSort::Newest => b.started_at.cmp(&a.started_at),
                RecordingSort::Oldest => a.started_at.cmp(&b.started_at),
                RecordingSort::SizeAsc => a.size_bytes.cmp(&b.size_bytes),
                RecordingSort::SizeDesc => b.size_bytes.cmp(&a.size_bytes),
            };
            primary.then_with(|| a.id.cmp(&b.id))
        });
        selected
            .into_iter()
            .skip(self.offset)
            .take(self.page_size())
            .collect()
    }
}

fn eq_filter(filter: &Option<String>, value: &str) -> bool {
    filter.as_deref().map_or(true, |f| f.is_empty() || f == value)
}

/// Storage for finalized recording rows.
pub trait RecordingRepository: Send + Sync {
    fn insert(&self, record: RecordingRecord) -> TetherResult<()>;
    fn get(&self, id: &str) -> TetherResult<Option<RecordingRecord>>;
    /// Most recent recording of a session.
    fn find_by_session(&self, session_id: &str) -> TetherResult<Option<RecordingRecord>>;
    fn list(&self, query: &RecordingQuery) -> TetherResult<Vec<RecordingRecord>>;
    /// Up to `limit` rows whose retention deadline is before `now`, oldest deadline first.
    fn expired(&self, now: DateTime<Utc>, limit: usize) -> TetherResult<Vec<RecordingRecord>>;
    /// Returns whether a row was removed.
    fn delete(&self, id: &str) -> TetherResult<bool>;
}

/// In-process [`RecordingRepository`].
#[derive(Debug, Default)]
pub struct MemoryRecordingRepository {
    rows: Mutex<HashMap<String, RecordingRecord>>,
}

impl MemoryRecordingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> std::sync::MutexGuard<'_, HashMap<String, RecordingRecord>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecordingRepository for MemoryRecordingRepository {
    fn insert(&self, record: RecordingRecord) -> TetherResult<()> {
        let mut rows = self.rows();
        if rows.contains_key(&record.id) {
            return Err(TetherError::Repository(format!(
                "recording {} already exists",
                record.id
            )));
        }
        rows.insert(record.id.clone(), record);
        Ok(())
    }

    fn get(&self, id: &str) -> TetherResult<Option<RecordingRecord>> {
        Ok(self.rows().get(id).cloned())
    }

    fn find_by_session(&self, session_id: &str) -> TetherResult<Option<RecordingRecord>> {
        Ok(self
            .rows()
            .values()
            .filter(|r| r.session_id == session_id)
            .max_by(|a, b| a.created_at.cmp(&b.created_at))
            .cloned())
    }

    fn list(&self, query: &RecordingQuery) -> TetherResult<Vec<RecordingRecord>> {
        Ok(query.apply(self.rows().values()))
    }

    fn expired(&self, now: DateTime<Utc>, limit: usize) -> TetherResult<Vec<RecordingRecord>> {
        let mut expired: Vec<RecordingRecord> = self
            .rows()
            .values()
            .filter(|r| r.retention_until.is_some_and(|t| t < now))
            .cloned()
            .collect();
        expired.sort_by(|a, b| {
            a.retention_until
                .cmp(&b.retention_until)
                .then_with(|| a.id.cmp(&b.id))
        });
        expired.truncate(limit);
        Ok(expired)
    }

    fn delete(&self, id: &str) -> TetherResult<bool> {
        Ok(self.rows().remove(id).is_some())
    }
}
