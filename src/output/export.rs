//! JSON-lines export of the assembled corpus
//!
//! One entry per line, in the corpus total order. The export pages through
//! the store with continuation tokens, so memory stays flat on large corpora.

use crate::storage::{EntryQuery, Storage, TimeRange};
use crate::CorpusError;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Entries fetched per storage query
const EXPORT_PAGE_SIZE: usize = 500;

/// Writes dated entries as JSON lines
///
/// # Arguments
///
/// * `storage` - The storage backend to read from
/// * `community` - Restrict to one community; `None` exports the whole corpus
/// * `writer` - Destination of the lines
///
/// # Returns
///
/// * `Ok(u64)` - Number of entries written
/// * `Err(CorpusError)` - Failed to query or write
pub fn export_entries<W: Write>(
    storage: &dyn Storage,
    community: Option<&str>,
    writer: &mut W,
) -> Result<u64, CorpusError> {
    let mut query = EntryQuery {
        community: community.map(str::to_string),
        range: TimeRange::all(),
        limit: EXPORT_PAGE_SIZE,
        continuation: None,
    };
    let mut written = 0;

    loop {
        let page = storage.query_entries(&query)?;
        for entry in &page.entries {
            serde_json::to_writer(&mut *writer, entry)?;
            writer.write_all(b"\n")?;
            written += 1;
        }

        match page.next {
            Some(next) => query.continuation = Some(next),
            None => break,
        }
    }

    writer.flush()?;
    Ok(written)
}

/// Exports the corpus to a JSON-lines file, replacing it
///
/// # Arguments
///
/// * `storage` - The storage backend to read from
/// * `community` - Restrict to one community; `None` exports the whole corpus
/// * `path` - File to write
///
/// # Returns
///
/// * `Ok(u64)` - Number of entries written
/// * `Err(CorpusError)` - Failed to query or write
pub fn export_to_path(
    storage: &dyn Storage,
    community: Option<&str>,
    path: &Path,
) -> Result<u64, CorpusError> {
    let mut writer = BufWriter::new(File::create(path)?);
    let written = export_entries(storage, community, &mut writer)?;
    tracing::info!("Exported {} entries to {}", written, path.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{Entry, PartialEntry};
    use crate::storage::SqliteStorage;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn fragment(community: &str, post: &str, id: Option<&str>, minute: u32) -> PartialEntry {
        let mut entry = match id {
            Some(id) => {
                let mut c = PartialEntry::comment(community, post, id);
                c.thread_id = Some(id.to_string());
                c
            }
            None => PartialEntry::post(community, post),
        };
        entry.date = Some(Utc.with_ymd_and_hms(2009, 6, 1, 8, minute, 0).unwrap());
        entry.content = Some(format!("{}-{}", post, minute));
        entry
    }

    fn storage_with_entries() -> SqliteStorage {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let now = Utc::now();
        for entry in [
            fragment("ftm", "2", None, 5),
            fragment("ftm", "1", None, 0),
            fragment("ftm", "1", Some("11"), 30),
            fragment("mtf", "9", None, 10),
        ] {
            storage.upsert_entry(&entry, now).unwrap();
        }
        // Undated placeholders are never exported
        let mut collapsed = PartialEntry::comment("ftm", "1", "12");
        collapsed.parent_id = Some("11".to_string());
        storage.upsert_entry(&collapsed, now).unwrap();
        storage
    }

    fn read_lines(bytes: &[u8]) -> Vec<Entry> {
        std::str::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_export_whole_corpus_in_order() {
        let storage = storage_with_entries();
        let mut out = Vec::new();

        let written = export_entries(&storage, None, &mut out).unwrap();
        assert_eq!(written, 4);

        let entries = read_lines(&out);
        let dates: Vec<_> = entries.iter().map(|e| e.date).collect();
        let mut sorted = dates.clone();
        sorted.sort();
        assert_eq!(dates, sorted);
        assert_eq!(entries[0].post_id, "1");
        assert_eq!(entries[3].id, "11");
    }

    #[test]
    fn test_export_single_community() {
        let storage = storage_with_entries();
        let mut out = Vec::new();

        let written = export_entries(&storage, Some("mtf"), &mut out).unwrap();
        assert_eq!(written, 1);
        assert_eq!(read_lines(&out)[0].community, "mtf");
    }

    #[test]
    fn test_export_line_fields() {
        let storage = storage_with_entries();
        let mut out = Vec::new();
        export_entries(&storage, Some("mtf"), &mut out).unwrap();

        let line: serde_json::Value =
            serde_json::from_slice(out.split(|b| *b == b'\n').next().unwrap()).unwrap();
        for field in [
            "community", "id", "kind", "post_id", "thread_id", "parent_id", "date", "content",
            "metadata",
        ] {
            assert!(line.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(line["kind"], "post");
        assert_eq!(line["date"], "2009-06-01T08:10:00Z");
    }

    #[test]
    fn test_export_to_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corpus.jsonl");
        let storage = storage_with_entries();

        assert_eq!(export_to_path(&storage, None, &path).unwrap(), 4);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 4);
    }
}
