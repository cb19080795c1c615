//! Corpus model and structural assembly
//!
//! - `Entry`: an exportable post or comment
//! - `PartialEntry`: what a single page revealed about an entry
//! - `Assembler`: merges fragments into the store and tracks dangling references

mod assembler;
mod entry;

pub use assembler::{AssemblerResult, Assembler, MergeOutcome, ReconcileReport};
pub use entry::{merge_fragments, Entry, EntryKind, Metadata, MetadataValue, PartialEntry};
