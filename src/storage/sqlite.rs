//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::corpus::{EntryKind, Metadata, PartialEntry};
use crate::state::{FrontierStatus, PageKind, PageTask};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    from_millis, to_millis, ContinuationToken, DanglingReason, DanglingRecord, EntryPage,
    EntryQuery, FailureRecord, FrontierRecord, RunRecord, RunStatus,
};
use crate::CorpusError;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

const ENTRY_COLUMNS: &str =
    "community, post_id, id, kind, thread_id, parent_id, date_ms, content, metadata";

/// Sort key of the corpus total order, shared by ORDER BY and the resume filter
const ENTRY_SORT_KEY: &str = "date_ms, length(post_id), post_id, \
     CASE kind WHEN 'post' THEN 0 ELSE 1 END, \
     length(COALESCE(thread_id, id)), COALESCE(thread_id, id), \
     length(id), id, community";

const FRONTIER_COLUMNS: &str =
    "url, community, kind, status, source, discovered_at, updated_at";

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(CorpusError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, CorpusError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, CorpusError> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    fn row_to_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
        Ok(RunRecord {
            id: row.get(0)?,
            started_at: row.get(1)?,
            finished_at: row.get(2)?,
            config_hash: row.get(3)?,
            status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
                .unwrap_or(RunStatus::Running),
        })
    }

    fn row_to_frontier(row: &Row<'_>) -> rusqlite::Result<FrontierRecord> {
        Ok(FrontierRecord {
            url: row.get(0)?,
            community: row.get(1)?,
            kind: PageKind::from_db_string(&row.get::<_, String>(2)?).unwrap_or(PageKind::Index),
            status: FrontierStatus::from_db_string(&row.get::<_, String>(3)?)
                .unwrap_or(FrontierStatus::Discovered),
            source: row.get(4)?,
            discovered_at: from_millis(row.get(5)?),
            updated_at: from_millis(row.get(6)?),
        })
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<PartialEntry> {
        let metadata_json: String = row.get(8)?;
        let metadata: Metadata = serde_json::from_str(&metadata_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;

        Ok(PartialEntry {
            community: row.get(0)?,
            post_id: row.get(1)?,
            id: row.get(2)?,
            kind: EntryKind::from_db_string(&row.get::<_, String>(3)?)
                .unwrap_or(EntryKind::Comment),
            thread_id: row.get(4)?,
            parent_id: row.get(5)?,
            date: row.get::<_, Option<i64>>(6)?.map(from_millis),
            content: row.get(7)?,
            metadata,
        })
    }

    fn row_to_dangling(row: &Row<'_>) -> rusqlite::Result<DanglingRecord> {
        Ok(DanglingRecord {
            community: row.get(0)?,
            post_id: row.get(1)?,
            entry_id: row.get(2)?,
            reason: DanglingReason::from_db_string(&row.get::<_, String>(3)?)
                .unwrap_or(DanglingReason::Parent),
            target_id: row.get(4)?,
        })
    }
}

impl Storage for SqliteStorage {
    // ===== Run Management =====

    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![now, config_hash, RunStatus::Running.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        self.conn
            .query_row(
                "SELECT id, started_at, finished_at, config_hash, status FROM runs WHERE id = ?1",
                params![run_id],
                Self::row_to_run,
            )
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let run = self
            .conn
            .query_row(
                "SELECT id, started_at, finished_at, config_hash, status FROM runs ORDER BY id DESC LIMIT 1",
                [],
                Self::row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    fn update_run_status(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE runs SET status = ?1 WHERE id = ?2",
            params![status.to_db_string(), run_id],
        )?;
        Ok(())
    }

    fn complete_run(&mut self, run_id: i64) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![RunStatus::Completed.to_db_string(), now, run_id],
        )?;
        Ok(())
    }

    fn clear_crawl_state(&mut self) -> StorageResult<()> {
        self.conn.execute_batch(
            "
            DELETE FROM frontier;
            DELETE FROM tasks;
            DELETE FROM failures;
            DELETE FROM dangling;
        ",
        )?;
        Ok(())
    }

    // ===== Frontier =====

    fn insert_discovered(&mut self, task: &PageTask, now: DateTime<Utc>) -> StorageResult<bool> {
        let now_ms = to_millis(now);
        let tx = self.conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO frontier (url, community, kind, status, source, discovered_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                task.url,
                task.community,
                task.kind.to_db_string(),
                FrontierStatus::Enqueued.to_db_string(),
                task.source,
                now_ms
            ],
        )?;

        if inserted == 1 {
            tx.execute(
                "INSERT OR IGNORE INTO tasks (url, community, kind, source, attempt, visible_at, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    task.url,
                    task.community,
                    task.kind.to_db_string(),
                    task.source,
                    task.attempt,
                    now_ms
                ],
            )?;
        }

        tx.commit()?;
        Ok(inserted == 1)
    }

    fn get_frontier(&self, url: &str) -> StorageResult<Option<FrontierRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {} FROM frontier WHERE url = ?1", FRONTIER_COLUMNS),
                params![url],
                Self::row_to_frontier,
            )
            .optional()?;
        Ok(record)
    }

    fn set_frontier_status(
        &mut self,
        url: &str,
        status: FrontierStatus,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE frontier SET status = ?1, updated_at = ?2 WHERE url = ?3",
            params![status.to_db_string(), to_millis(now), url],
        )?;
        Ok(())
    }

    fn stale_in_progress(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<FrontierRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM frontier WHERE status = ?1 AND updated_at < ?2 ORDER BY updated_at",
            FRONTIER_COLUMNS
        ))?;
        let records = stmt
            .query_map(
                params![FrontierStatus::InProgress.to_db_string(), to_millis(cutoff)],
                Self::row_to_frontier,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn count_frontier_by_status(&self) -> StorageResult<HashMap<FrontierStatus, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM frontier GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(status, count)| {
                FrontierStatus::from_db_string(&status).map(|s| (s, count as u64))
            })
            .collect())
    }

    fn count_frontier_by_kind(&self) -> StorageResult<HashMap<PageKind, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT kind, COUNT(*) FROM frontier GROUP BY kind")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(kind, count)| PageKind::from_db_string(&kind).map(|k| (k, count as u64)))
            .collect())
    }

    // ===== Dispatch Queue =====

    fn insert_task(&mut self, task: &PageTask, visible_at: DateTime<Utc>) -> StorageResult<bool> {
        let ms = to_millis(visible_at);
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO tasks (url, community, kind, source, attempt, visible_at, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                task.url,
                task.community,
                task.kind.to_db_string(),
                task.source,
                task.attempt,
                ms
            ],
        )?;
        Ok(inserted == 1)
    }

    fn lease_tasks(
        &mut self,
        now: DateTime<Utc>,
        hidden_until: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<PageTask>> {
        let tx = self.conn.transaction()?;

        let tasks = {
            let mut stmt = tx.prepare(
                "SELECT url, community, kind, source, attempt FROM tasks
                 WHERE visible_at <= ?1
                 ORDER BY visible_at, enqueued_at
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![to_millis(now), limit as i64], |row| {
                Ok(PageTask {
                    url: row.get(0)?,
                    community: row.get(1)?,
                    kind: PageKind::from_db_string(&row.get::<_, String>(2)?)
                        .unwrap_or(PageKind::Index),
                    source: row.get(3)?,
                    attempt: row.get(4)?,
                })
            })?;
            let tasks = rows.collect::<Result<Vec<_>, _>>()?;
            tasks
        };

        for task in &tasks {
            tx.execute(
                "UPDATE tasks SET visible_at = ?1 WHERE url = ?2",
                params![to_millis(hidden_until), task.url],
            )?;
        }

        tx.commit()?;
        Ok(tasks)
    }

    fn delete_task(&mut self, url: &str) -> StorageResult<()> {
        self.conn
            .execute("DELETE FROM tasks WHERE url = ?1", params![url])?;
        Ok(())
    }

    fn retry_task(
        &mut self,
        url: &str,
        visible_at: DateTime<Utc>,
        error: &str,
    ) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE tasks SET attempt = attempt + 1, visible_at = ?1, last_error = ?2 WHERE url = ?3",
            params![to_millis(visible_at), error, url],
        )?;
        Ok(())
    }

    fn count_tasks(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn next_visible_at(&self) -> StorageResult<Option<DateTime<Utc>>> {
        let ms: Option<i64> = self
            .conn
            .query_row("SELECT MIN(visible_at) FROM tasks", [], |row| row.get(0))?;
        Ok(ms.map(from_millis))
    }

    // ===== Failures =====

    fn record_failure(&mut self, failure: &FailureRecord) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO failures (url, community, kind, attempts, error_class, message, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                failure.url,
                failure.community,
                failure.kind.map(|k| k.to_db_string()),
                failure.attempts,
                failure.error_class,
                failure.message,
                to_millis(failure.failed_at)
            ],
        )?;
        Ok(())
    }

    fn clear_failures(&mut self, error_class: &str) -> StorageResult<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM failures WHERE error_class = ?1", params![error_class])?;
        Ok(removed)
    }

    fn list_failures(&self) -> StorageResult<Vec<FailureRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT url, community, kind, attempts, error_class, message, failed_at
             FROM failures ORDER BY id",
        )?;
        let failures = stmt
            .query_map([], |row| {
                Ok(FailureRecord {
                    url: row.get(0)?,
                    community: row.get(1)?,
                    kind: row
                        .get::<_, Option<String>>(2)?
                        .and_then(|k| PageKind::from_db_string(&k)),
                    attempts: row.get(3)?,
                    error_class: row.get(4)?,
                    message: row.get(5)?,
                    failed_at: from_millis(row.get(6)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(failures)
    }

    fn count_failures_by_class(&self) -> StorageResult<HashMap<String, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT error_class, COUNT(*) FROM failures GROUP BY error_class")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }

    // ===== Entries =====

    fn get_entry(
        &self,
        community: &str,
        post_id: &str,
        id: &str,
    ) -> StorageResult<Option<PartialEntry>> {
        let entry = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM entries WHERE community = ?1 AND post_id = ?2 AND id = ?3",
                    ENTRY_COLUMNS
                ),
                params![community, post_id, id],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn upsert_entry(&mut self, entry: &PartialEntry, now: DateTime<Utc>) -> StorageResult<()> {
        let metadata = serde_json::to_string(&entry.metadata)?;
        self.conn.execute(
            "INSERT INTO entries (community, post_id, id, kind, thread_id, parent_id, date_ms,
                                  content, metadata, content_hash, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(community, post_id, id) DO UPDATE SET
                kind = excluded.kind,
                thread_id = excluded.thread_id,
                parent_id = excluded.parent_id,
                date_ms = excluded.date_ms,
                content = excluded.content,
                metadata = excluded.metadata,
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at",
            params![
                entry.community,
                entry.post_id,
                entry.id,
                entry.kind.to_db_string(),
                entry.thread_id,
                entry.parent_id,
                entry.date.map(to_millis),
                entry.content,
                metadata,
                entry.content_hash(),
                to_millis(now)
            ],
        )?;
        Ok(())
    }

    fn children_of(
        &self,
        community: &str,
        post_id: &str,
        parent_id: &str,
    ) -> StorageResult<Vec<PartialEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM entries WHERE community = ?1 AND post_id = ?2 AND parent_id = ?3",
            ENTRY_COLUMNS
        ))?;
        let children = stmt
            .query_map(params![community, post_id, parent_id], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(children)
    }

    fn query_entries(&self, query: &EntryQuery) -> StorageResult<EntryPage> {
        let limit = query.limit.max(1);
        let after = query.continuation.as_ref();

        // Total order: date, then post, posts before their comments, thread, id.
        // Numeric ids compare by length first so "9" sorts before "10".
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {columns} FROM entries
             WHERE date_ms IS NOT NULL
               AND (?1 IS NULL OR community = ?1)
               AND (?2 IS NULL OR date_ms >= ?2)
               AND (?3 IS NULL OR date_ms < ?3)
               AND (?5 IS NULL OR ({key}) > (?5, length(?6), ?6, ?7, length(?8), ?8, length(?9), ?9, ?10))
             ORDER BY {key}
             LIMIT ?4",
            columns = ENTRY_COLUMNS,
            key = ENTRY_SORT_KEY
        ))?;

        let mut entries = stmt
            .query_map(
                params![
                    query.community,
                    query.range.start.map(to_millis),
                    query.range.end.map(to_millis),
                    (limit + 1) as i64,
                    after.map(|c| c.date_ms()),
                    after.map(|c| c.post_id()),
                    after.map(|c| c.kind_rank()),
                    after.map(|c| c.thread_key()),
                    after.map(|c| c.id()),
                    after.map(|c| c.community()),
                ],
                Self::row_to_entry,
            )?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(PartialEntry::into_entry)
            .collect::<Vec<_>>();

        let next = if entries.len() > limit {
            entries.truncate(limit);
            entries.last().map(ContinuationToken::after)
        } else {
            None
        };

        Ok(EntryPage { entries, next })
    }

    fn count_entries_by_kind(&self) -> StorageResult<HashMap<EntryKind, (u64, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, COUNT(*), SUM(CASE WHEN date_ms IS NULL THEN 0 ELSE 1 END)
             FROM entries GROUP BY kind",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(kind, total, dated)| {
                EntryKind::from_db_string(&kind).map(|k| (k, (total as u64, dated as u64)))
            })
            .collect())
    }

    // ===== Dangling References =====

    fn record_dangling(
        &mut self,
        record: &DanglingRecord,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO dangling (community, post_id, entry_id, reason, target_id, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(community, post_id, entry_id, reason) DO UPDATE SET
                target_id = excluded.target_id",
            params![
                record.community,
                record.post_id,
                record.entry_id,
                record.reason.to_db_string(),
                record.target_id,
                to_millis(now)
            ],
        )?;
        Ok(())
    }

    fn list_dangling(&self) -> StorageResult<Vec<DanglingRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT community, post_id, entry_id, reason, target_id FROM dangling
             ORDER BY detected_at, community, post_id, entry_id",
        )?;
        let records = stmt
            .query_map([], Self::row_to_dangling)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn resolve_dangling(&mut self, record: &DanglingRecord) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM dangling WHERE community = ?1 AND post_id = ?2 AND entry_id = ?3 AND reason = ?4",
            params![
                record.community,
                record.post_id,
                record.entry_id,
                record.reason.to_db_string()
            ],
        )?;
        Ok(())
    }
}
