//! Structural assembler
//!
//! Merges fragments arriving from any page, in any order, into one stored
//! record per logical entry and keeps the reply structure consistent:
//! - replies inherit the thread of their stored parent
//! - a thread change on an entry is pushed down to its whole subtree
//! - references to posts or parents not stored yet are recorded as dangling
//!   and revisited by `reconcile`

use crate::corpus::entry::{merge_fragments, EntryKind, PartialEntry};
use crate::storage::{self, DanglingReason, DanglingRecord, SharedStorage, SqliteStorage, Storage};
use crate::CorpusError;
use chrono::Utc;
use std::collections::VecDeque;

/// What a merge did to the stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No record existed; the fragment was stored
    Inserted,
    /// The fragment was more complete and replaced the stored record
    Superseded,
    /// The stored record stayed and gained fields from the fragment
    Filled,
    /// The fragment added nothing
    Unchanged,
}

/// Result of merging one fragment
#[derive(Debug, Clone)]
pub struct AssemblerResult {
    pub outcome: MergeOutcome,
    /// The id under which the fragment was stored
    pub id: String,
    /// References that could not be resolved yet
    pub dangling: Vec<DanglingRecord>,
}

/// Summary of a reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub resolved: usize,
    pub remaining: usize,
    /// Entries whose thread id was corrected
    pub rethreaded: usize,
}

/// Merges entry fragments into the corpus store
#[derive(Clone)]
pub struct Assembler {
    storage: SharedStorage,
}

impl Assembler {
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }

    /// Merges one fragment into the store
    ///
    /// The read-merge-write sequence runs under the storage lock, so
    /// concurrent merges of the same key serialize and never duplicate.
    ///
    /// # Returns
    ///
    /// * `Ok(AssemblerResult)` - What happened, plus any dangling references
    /// * `Err(CorpusError)` - The store could not be read or written
    pub fn merge(&self, mut fragment: PartialEntry) -> Result<AssemblerResult, CorpusError> {
        fragment.ensure_id();
        if fragment.kind == EntryKind::Post {
            fragment.id = fragment.post_id.clone();
            fragment.parent_id = None;
            fragment.thread_id = Some(fragment.post_id.clone());
        }

        let mut store = storage::lock(&self.storage)?;
        let existing = store.get_entry(&fragment.community, &fragment.post_id, &fragment.id)?;

        let mut merged = match &existing {
            Some(stored) => merge_fragments(stored, &fragment),
            None => fragment.clone(),
        };
        inherit_thread(&*store, &mut merged)?;

        let outcome = match &existing {
            None => MergeOutcome::Inserted,
            Some(stored) if *stored == merged => MergeOutcome::Unchanged,
            Some(stored) if fragment.outranks(stored) => MergeOutcome::Superseded,
            Some(_) => MergeOutcome::Filled,
        };

        if outcome != MergeOutcome::Unchanged {
            store.upsert_entry(&merged, Utc::now())?;

            let thread_changed =
                existing.as_ref().map(|e| &e.thread_id) != Some(&merged.thread_id);
            if thread_changed {
                if let Some(thread_id) = &merged.thread_id {
                    propagate_thread(&mut store, &merged, thread_id)?;
                }
            }
        }

        let dangling = find_dangling(&mut store, &merged)?;
        for record in &dangling {
            tracing::debug!(
                "Dangling {} reference: {}/{}/{} -> {}",
                record.reason.to_db_string(),
                record.community,
                record.post_id,
                record.entry_id,
                record.target_id
            );
        }

        Ok(AssemblerResult {
            outcome,
            id: merged.id,
            dangling,
        })
    }

    /// Revisits every dangling reference
    ///
    /// A reference whose target is now stored is cleared; a resolved parent
    /// also hands its thread id down to the child's subtree.
    pub fn reconcile(&self) -> Result<ReconcileReport, CorpusError> {
        let mut store = storage::lock(&self.storage)?;
        let mut report = ReconcileReport::default();

        for record in store.list_dangling()? {
            let target = store.get_entry(&record.community, &record.post_id, &record.target_id)?;
            let Some(target) = target else {
                report.remaining += 1;
                continue;
            };

            if record.reason == DanglingReason::Parent {
                let child = store.get_entry(&record.community, &record.post_id, &record.entry_id)?;
                if let (Some(mut child), Some(thread_id)) = (child, target.thread_id.clone()) {
                    if child.thread_id.as_ref() != Some(&thread_id) {
                        child.thread_id = Some(thread_id.clone());
                        store.upsert_entry(&child, Utc::now())?;
                        report.rethreaded += 1 + propagate_thread(&mut store, &child, &thread_id)?;
                    }
                }
            }

            store.resolve_dangling(&record)?;
            report.resolved += 1;
        }

        if report.resolved > 0 {
            tracing::info!(
                "Reconciled {} dangling references ({} still open, {} entries re-threaded)",
                report.resolved,
                report.remaining,
                report.rethreaded
            );
        }

        Ok(report)
    }
}

/// Takes the thread id of the stored parent, if there is one
fn inherit_thread(store: &SqliteStorage, entry: &mut PartialEntry) -> Result<(), CorpusError> {
    if entry.kind != EntryKind::Comment {
        return Ok(());
    }
    if let Some(parent_id) = &entry.parent_id {
        if let Some(parent) = store.get_entry(&entry.community, &entry.post_id, parent_id)? {
            if parent.thread_id.is_some() {
                entry.thread_id = parent.thread_id;
            }
        }
    }
    Ok(())
}

/// Rewrites the thread id of every stored descendant of `root`
///
/// Returns the number of entries changed.
fn propagate_thread(
    store: &mut SqliteStorage,
    root: &PartialEntry,
    thread_id: &str,
) -> Result<usize, CorpusError> {
    let mut changed = 0;
    let mut queue = VecDeque::from([root.id.clone()]);

    while let Some(parent_id) = queue.pop_front() {
        for mut child in store.children_of(&root.community, &root.post_id, &parent_id)? {
            if child.id == root.id {
                continue;
            }
            if child.thread_id.as_deref() != Some(thread_id) {
                child.thread_id = Some(thread_id.to_string());
                store.upsert_entry(&child, Utc::now())?;
                changed += 1;
                queue.push_back(child.id);
            }
        }
    }

    Ok(changed)
}

/// Records references from `entry` to a post or parent that is not stored
fn find_dangling(
    store: &mut SqliteStorage,
    entry: &PartialEntry,
) -> Result<Vec<DanglingRecord>, CorpusError> {
    let mut dangling = Vec::new();
    if entry.kind != EntryKind::Comment {
        return Ok(dangling);
    }

    let mut targets = vec![(DanglingReason::Post, entry.post_id.clone())];
    if let Some(parent_id) = &entry.parent_id {
        targets.push((DanglingReason::Parent, parent_id.clone()));
    }

    for (reason, target_id) in targets {
        if store
            .get_entry(&entry.community, &entry.post_id, &target_id)?
            .is_none()
        {
            let record = DanglingRecord {
                community: entry.community.clone(),
                post_id: entry.post_id.clone(),
                entry_id: entry.id.clone(),
                target_id,
                reason,
            };
            store.record_dangling(&record, Utc::now())?;
            dangling.push(record);
        }
    }

    Ok(dangling)
}
