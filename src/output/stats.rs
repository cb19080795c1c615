//! Statistics generation from the crawl database
//!
//! This module provides functionality for extracting and displaying
//! crawl and corpus statistics, and the operator-facing failure list.

use crate::corpus::EntryKind;
use crate::state::{FrontierStatus, PageKind};
use crate::storage::{FailureRecord, RunRecord, Storage};
use crate::CorpusError;
use std::collections::HashMap;

/// Crawl and corpus statistics summary
#[derive(Debug, Clone)]
pub struct CorpusStatistics {
    /// The most recent crawl run, if any
    pub latest_run: Option<RunRecord>,

    /// Frontier URLs by status
    pub frontier_by_status: HashMap<FrontierStatus, u64>,

    /// Frontier URLs by page kind
    pub frontier_by_kind: HashMap<PageKind, u64>,

    /// Tasks still queued or leased
    pub outstanding_tasks: u64,

    /// Stored entries by kind as (total, dated)
    pub entries_by_kind: HashMap<EntryKind, (u64, u64)>,

    /// Failure list size by error class
    pub failures_by_class: HashMap<String, u64>,

    /// Dangling references awaiting reconciliation
    pub dangling: u64,
}

impl CorpusStatistics {
    /// Total URLs known to the frontier
    pub fn total_urls(&self) -> u64 {
        self.frontier_by_status.values().sum()
    }

    /// Entries that will appear in an export
    pub fn exportable_entries(&self) -> u64 {
        self.entries_by_kind.values().map(|(_, dated)| dated).sum()
    }
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `storage` - The storage backend to query
///
/// # Returns
///
/// * `Ok(CorpusStatistics)` - Successfully loaded statistics
/// * `Err(CorpusError)` - Failed to query statistics
pub fn load_statistics(storage: &dyn Storage) -> Result<CorpusStatistics, CorpusError> {
    Ok(CorpusStatistics {
        latest_run: storage.get_latest_run()?,
        frontier_by_status: storage.count_frontier_by_status()?,
        frontier_by_kind: storage.count_frontier_by_kind()?,
        outstanding_tasks: storage.count_tasks()?,
        entries_by_kind: storage.count_entries_by_kind()?,
        failures_by_class: storage.count_failures_by_class()?,
        dangling: storage.list_dangling()?.len() as u64,
    })
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &CorpusStatistics) {
    println!("=== Corpus Statistics ===\n");

    if let Some(run) = &stats.latest_run {
        println!("Latest run:");
        println!("  Id: {}", run.id);
        println!("  Status: {}", run.status.to_db_string());
        println!("  Started: {}", run.started_at);
        if let Some(finished) = &run.finished_at {
            println!("  Finished: {}", finished);
        }
        println!();
    }

    let total = stats.total_urls();
    println!("Frontier ({} URLs, {} tasks outstanding):", total, stats.outstanding_tasks);
    for status in FrontierStatus::all_states() {
        let count = stats.frontier_by_status.get(&status).copied().unwrap_or(0);
        if count == 0 {
            continue;
        }
        let percentage = if total > 0 {
            (count as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        println!("  {}: {} ({:.1}%)", status, count, percentage);
    }
    for kind in [PageKind::Index, PageKind::Post, PageKind::CommentThread] {
        let count = stats.frontier_by_kind.get(&kind).copied().unwrap_or(0);
        println!("  {} pages: {}", kind, count);
    }
    println!();

    println!("Entries ({} exportable):", stats.exportable_entries());
    for kind in [EntryKind::Post, EntryKind::Comment] {
        let (count, dated) = stats.entries_by_kind.get(&kind).copied().unwrap_or((0, 0));
        println!("  {}: {} stored, {} dated", kind, count, dated);
    }
    println!("  Dangling references: {}", stats.dangling);
    println!();

    if !stats.failures_by_class.is_empty() {
        println!("Failures:");
        let mut classes: Vec<_> = stats.failures_by_class.iter().collect();
        classes.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (class, count) in classes {
            println!("  {}: {}", class, count);
        }
        println!();
    }
}

/// Prints the failure list, oldest first
pub fn print_failures(failures: &[FailureRecord]) {
    println!("=== Failures ({}) ===\n", failures.len());

    for failure in failures {
        let kind = failure
            .kind
            .map(|k| k.to_string())
            .unwrap_or_else(|| "entry".to_string());
        println!(
            "{} [{}] {} ({}, {} attempts)",
            failure.failed_at.format("%Y-%m-%d %H:%M:%S"),
            failure.error_class,
            failure.url,
            kind,
            failure.attempts
        );
        println!("    {}", failure.message);
    }
}
