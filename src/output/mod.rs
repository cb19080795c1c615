//! Output module for exporting the corpus and reporting on crawls
//!
//! This module handles:
//! - JSON-lines export of entries in total order
//! - Crawl and corpus statistics
//! - The failure report

mod export;
pub mod stats;

pub use export::{export_entries, export_to_path};
pub use stats::{load_statistics, print_failures, print_statistics, CorpusStatistics};
