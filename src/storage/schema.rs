//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Sumi-Corpus database.
//! Times are stored as integer milliseconds since the epoch.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Track crawl runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    status TEXT NOT NULL
);

-- Every URL ever discovered, keyed by its normalized form
CREATE TABLE IF NOT EXISTS frontier (
    url TEXT PRIMARY KEY,
    community TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    source TEXT NOT NULL,
    discovered_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_frontier_status ON frontier(status, updated_at);

-- Durable dispatch queue; a row exists while its task is live
CREATE TABLE IF NOT EXISTS tasks (
    url TEXT PRIMARY KEY,
    community TEXT NOT NULL,
    kind TEXT NOT NULL,
    source TEXT NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 0,
    visible_at INTEGER NOT NULL,
    last_error TEXT,
    enqueued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_visible ON tasks(visible_at);

-- Operator-visible failure list
CREATE TABLE IF NOT EXISTS failures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    community TEXT NOT NULL,
    kind TEXT,
    attempts INTEGER NOT NULL,
    error_class TEXT NOT NULL,
    message TEXT NOT NULL,
    failed_at INTEGER NOT NULL
);

-- Assembled corpus entries
CREATE TABLE IF NOT EXISTS entries (
    community TEXT NOT NULL,
    post_id TEXT NOT NULL,
    id TEXT NOT NULL,
    kind TEXT NOT NULL,
    thread_id TEXT,
    parent_id TEXT,
    date_ms INTEGER,
    content TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    content_hash TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (community, post_id, id)
);

CREATE INDEX IF NOT EXISTS idx_entries_date ON entries(community, date_ms);
CREATE INDEX IF NOT EXISTS idx_entries_parent ON entries(community, post_id, parent_id);

-- Forward references waiting for their target entry
CREATE TABLE IF NOT EXISTS dangling (
    community TEXT NOT NULL,
    post_id TEXT NOT NULL,
    entry_id TEXT NOT NULL,
    reason TEXT NOT NULL,
    target_id TEXT NOT NULL,
    detected_at INTEGER NOT NULL,
    PRIMARY KEY (community, post_id, entry_id, reason)
);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        assert!(initialize_schema(&conn).is_ok());
    }

    #[test]
    fn test_tables_exist_after_init() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        for table in ["runs", "frontier", "tasks", "failures", "entries", "dangling"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "Table {} should exist", table);
        }
    }
}
