//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::corpus::{EntryKind, PartialEntry};
use crate::state::{FrontierStatus, PageKind, PageTask};
use crate::storage::{
    DanglingRecord, EntryPage, EntryQuery, FailureRecord, FrontierRecord, RunRecord, RunStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Invalid status transition for {url}: {from} -> {to}")]
    InvalidTransition {
        url: String,
        from: FrontierStatus,
        to: FrontierStatus,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// This trait defines all database operations needed by the crawler. Each
/// method is a single statement or transaction, so a caller that holds the
/// backend exclusively can compose read-modify-write sequences safely.
pub trait Storage {
    // ===== Run Management =====

    /// Creates a new crawl run
    ///
    /// # Arguments
    ///
    /// * `config_hash` - Hash of the configuration file
    ///
    /// # Returns
    ///
    /// The ID of the newly created run
    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64>;

    /// Gets a run by ID
    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    /// Gets the most recent run
    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Updates the status of a run
    fn update_run_status(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()>;

    /// Marks a run as completed with a finish timestamp
    fn complete_run(&mut self, run_id: i64) -> StorageResult<()>;

    /// Drops frontier, queue, failure and dangling state (entries are kept)
    fn clear_crawl_state(&mut self) -> StorageResult<()>;

    // ===== Frontier =====

    /// Records a newly discovered URL with its first task, atomically
    ///
    /// # Returns
    ///
    /// `true` if the URL was new; `false` if it was already known, in which
    /// case nothing is written.
    fn insert_discovered(&mut self, task: &PageTask, now: DateTime<Utc>) -> StorageResult<bool>;

    /// Gets the frontier record of a URL
    fn get_frontier(&self, url: &str) -> StorageResult<Option<FrontierRecord>>;

    /// Overwrites the status of a frontier record
    fn set_frontier_status(
        &mut self,
        url: &str,
        status: FrontierStatus,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Frontier records in progress since before `cutoff`
    fn stale_in_progress(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<FrontierRecord>>;

    /// Counts frontier records by status
    fn count_frontier_by_status(&self) -> StorageResult<HashMap<FrontierStatus, u64>>;

    // ===== Dispatch Queue =====

    /// Inserts a task unless one already exists for its URL
    fn insert_task(&mut self, task: &PageTask, visible_at: DateTime<Utc>) -> StorageResult<bool>;

    /// Leases up to `limit` visible tasks, hiding them until `hidden_until`
    fn lease_tasks(
        &mut self,
        now: DateTime<Utc>,
        hidden_until: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<PageTask>>;

    /// Removes a task
    fn delete_task(&mut self, url: &str) -> StorageResult<()>;

    /// Bumps a task's attempt count and hides it until `visible_at`
    fn retry_task(
        &mut self,
        url: &str,
        visible_at: DateTime<Utc>,
        error: &str,
    ) -> StorageResult<()>;

    /// Counts live tasks, leased or not
    fn count_tasks(&self) -> StorageResult<u64>;

    /// Earliest time any task becomes visible
    fn next_visible_at(&self) -> StorageResult<Option<DateTime<Utc>>>;

    // ===== Failures =====

    /// Appends to the failure list
    fn record_failure(&mut self, failure: &FailureRecord) -> StorageResult<()>;

    /// Removes every failure of one error class
    ///
    /// # Returns
    ///
    /// The number of rows removed.
    fn clear_failures(&mut self, error_class: &str) -> StorageResult<usize>;

    /// Reads the failure list, oldest first
    fn list_failures(&self) -> StorageResult<Vec<FailureRecord>>;

    /// Counts failures by error class
    fn count_failures_by_class(&self) -> StorageResult<HashMap<String, u64>>;

    // ===== Entries =====

    /// Point lookup of a stored fragment
    fn get_entry(
        &self,
        community: &str,
        post_id: &str,
        id: &str,
    ) -> StorageResult<Option<PartialEntry>>;

    /// Inserts or replaces a fragment under its identity key
    fn upsert_entry(&mut self, entry: &PartialEntry, now: DateTime<Utc>) -> StorageResult<()>;

    /// Direct replies to an entry
    fn children_of(
        &self,
        community: &str,
        post_id: &str,
        parent_id: &str,
    ) -> StorageResult<Vec<PartialEntry>>;

    /// Dated entries in the corpus total order
    fn query_entries(&self, query: &EntryQuery) -> StorageResult<EntryPage>;

    /// Counts stored fragments by kind, and how many of them are dated
    fn count_entries_by_kind(&self) -> StorageResult<HashMap<EntryKind, (u64, u64)>>;

    // ===== Dangling References =====

    /// Records a dangling reference (idempotent)
    fn record_dangling(&mut self, record: &DanglingRecord, now: DateTime<Utc>)
        -> StorageResult<()>;

    /// Lists unresolved dangling references
    fn list_dangling(&self) -> StorageResult<Vec<DanglingRecord>>;

    /// Removes a resolved dangling reference
    fn resolve_dangling(&mut self, record: &DanglingRecord) -> StorageResult<()>;

    // ===== Statistics =====

    /// Counts frontier records per page kind
    fn count_frontier_by_kind(&self) -> StorageResult<HashMap<PageKind, u64>>;
}
