//! Storage module for persisting crawl and corpus data
//!
//! This module handles all database operations for the crawler, including:
//! - SQLite database initialization and schema management
//! - Frontier records and the durable dispatch queue
//! - Failure and dangling-reference bookkeeping
//! - Corpus entries with ordered, resumable queries
//! - Run tracking and resumption support

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::corpus::{Entry, EntryKind};
use crate::state::{FrontierStatus, PageKind};
use crate::CorpusError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Storage handle shared by the frontier, queue, assembler and workers
pub type SharedStorage = Arc<Mutex<SqliteStorage>>;

/// Initializes or opens a storage database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStorage)` - Successfully initialized storage
/// * `Err(CorpusError)` - Failed to initialize storage
pub fn open_storage(path: &Path) -> Result<SqliteStorage, CorpusError> {
    SqliteStorage::new(path)
}

/// Wraps a storage backend for sharing across tasks
pub fn share(storage: SqliteStorage) -> SharedStorage {
    Arc::new(Mutex::new(storage))
}

/// Locks shared storage, turning a poisoned lock into a storage error
pub fn lock(storage: &SharedStorage) -> Result<MutexGuard<'_, SqliteStorage>, StorageError> {
    storage
        .lock()
        .map_err(|_| StorageError::Database("storage lock poisoned".to_string()))
}

/// Milliseconds since the epoch, the storage time representation
pub fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Inverse of [`to_millis`]
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A URL known to the frontier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontierRecord {
    pub url: String,
    pub community: String,
    pub kind: PageKind,
    pub status: FrontierStatus,
    pub source: String,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task that ended on the failure list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub url: String,
    pub community: String,
    pub kind: Option<PageKind>,
    pub attempts: u32,
    pub error_class: String,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

/// Why an entry is waiting on something that has not been stored yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DanglingReason {
    /// The entry's post has not been stored
    Post,
    /// The entry's parent comment has not been stored
    Parent,
}

impl DanglingReason {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Parent => "parent",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "post" => Some(Self::Post),
            "parent" => Some(Self::Parent),
            _ => None,
        }
    }
}

/// An advisory forward reference awaiting reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DanglingRecord {
    pub community: String,
    pub post_id: String,
    pub entry_id: String,
    /// Id of the missing post or parent
    pub target_id: String,
    pub reason: DanglingReason,
}

/// Half-open `[start, end)` date range; open ends are unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }
}

/// Opaque resume point of an ordered entry query
///
/// Holds the sort key of the last entry returned. The next page starts
/// strictly after that key, so writes between pages never repeat or skip an
/// entry that sorts after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationToken {
    date_ms: i64,
    post_id: String,
    kind_rank: i64,
    thread_key: String,
    id: String,
    community: String,
}

impl ContinuationToken {
    /// Token resuming right after `entry`
    pub(crate) fn after(entry: &Entry) -> Self {
        Self {
            date_ms: to_millis(entry.date),
            post_id: entry.post_id.clone(),
            kind_rank: kind_rank(entry.kind),
            thread_key: entry.thread_id.clone(),
            id: entry.id.clone(),
            community: entry.community.clone(),
        }
    }

    pub(crate) fn date_ms(&self) -> i64 {
        self.date_ms
    }

    pub(crate) fn post_id(&self) -> &str {
        &self.post_id
    }

    pub(crate) fn kind_rank(&self) -> i64 {
        self.kind_rank
    }

    pub(crate) fn thread_key(&self) -> &str {
        &self.thread_key
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn community(&self) -> &str {
        &self.community
    }
}

/// Sort rank of an entry kind: a post precedes its comments
pub(crate) fn kind_rank(kind: EntryKind) -> i64 {
    match kind {
        EntryKind::Post => 0,
        EntryKind::Comment => 1,
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_vec(self).map_err(|_| fmt::Error)?;
        write!(f, "{}", hex::encode(json))
    }
}

impl FromStr for ContinuationToken {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex::decode(s)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or_else(|| StorageError::Serialization(format!("bad continuation token '{}'", s)))
    }
}

/// Parameters of an ordered corpus query
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
    /// Restrict to one community; `None` reads the whole corpus
    pub community: Option<String>,
    pub range: TimeRange,
    pub limit: usize,
    pub continuation: Option<ContinuationToken>,
}

/// One page of an ordered corpus query
#[derive(Debug, Clone)]
pub struct EntryPage {
    pub entries: Vec<Entry>,
    /// Present when more entries follow
    pub next: Option<ContinuationToken>,
}

/// Represents a crawl run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
}

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}
