//! Corpus entry types and the completeness merge
//!
//! A `PartialEntry` is what a single page reveals about a post or comment.
//! Fragments of the same logical entry are merged by completeness: the more
//! complete fragment wins and its gaps are filled from the other. Ties are
//! broken by content hash so the result does not depend on arrival order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Whether an entry is a post or a comment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Post,
    Comment,
}

impl EntryKind {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Comment => "comment",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "post" => Some(Self::Post),
            "comment" => Some(Self::Comment),
            _ => None,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// A metadata value: text or a number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// A complete, exportable corpus entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub community: String,
    pub id: String,
    pub kind: EntryKind,
    pub post_id: String,
    pub thread_id: String,
    pub parent_id: Option<String>,
    pub date: DateTime<Utc>,
    pub content: String,
    pub metadata: Metadata,
}

/// What one page revealed about an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialEntry {
    pub community: String,
    /// Source id; empty when the page exposed none
    pub id: String,
    pub kind: EntryKind,
    pub post_id: String,
    pub thread_id: Option<String>,
    pub parent_id: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub content: Option<String>,
    pub metadata: Metadata,
}

impl PartialEntry {
    /// Creates the skeleton of a post fragment
    pub fn post(community: &str, post_id: &str) -> Self {
        Self {
            community: community.to_string(),
            id: post_id.to_string(),
            kind: EntryKind::Post,
            post_id: post_id.to_string(),
            thread_id: Some(post_id.to_string()),
            parent_id: None,
            date: None,
            content: None,
            metadata: Metadata::new(),
        }
    }

    /// Creates the skeleton of a comment fragment
    pub fn comment(community: &str, post_id: &str, id: &str) -> Self {
        Self {
            community: community.to_string(),
            id: id.to_string(),
            kind: EntryKind::Comment,
            post_id: post_id.to_string(),
            thread_id: None,
            parent_id: None,
            date: None,
            content: None,
            metadata: Metadata::new(),
        }
    }

    /// Assigns a stable id to fragments the source gave none
    ///
    /// The derived id digests the fragment's position and content, so the
    /// same anonymous fragment maps to the same key on every delivery.
    pub fn ensure_id(&mut self) {
        if !self.id.is_empty() {
            return;
        }
        let mut hasher = Sha256::new();
        for part in [
            Some(self.post_id.as_str()),
            self.thread_id.as_deref(),
            self.parent_id.as_deref(),
            self.content.as_deref(),
        ] {
            hasher.update(part.unwrap_or("").as_bytes());
            hasher.update([0u8]);
        }
        let digest = hex::encode(hasher.finalize());
        self.id = format!("h:{}", &digest[..16]);
    }

    /// Weighted count of known fields; the date and body dominate
    pub fn completeness(&self) -> u32 {
        let mut score = 0;
        if self.date.is_some() {
            score += 4;
        }
        if self.content.as_deref().is_some_and(|c| !c.is_empty()) {
            score += 4;
        }
        if self.thread_id.is_some() {
            score += 1;
        }
        if self.parent_id.is_some() {
            score += 1;
        }
        score + self.metadata.len() as u32
    }

    /// Hex SHA-256 over every field
    pub fn content_hash(&self) -> String {
        // Serialization of plain structs and BTreeMaps cannot fail
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    fn rank(&self) -> (u32, String) {
        (self.completeness(), self.content_hash())
    }

    /// Returns true if `self` outranks `other` in the completeness order
    pub fn outranks(&self, other: &PartialEntry) -> bool {
        self.rank() > other.rank()
    }

    /// Returns a copy of `self` with every missing field taken from `other`
    pub fn filled_from(&self, other: &PartialEntry) -> PartialEntry {
        let mut merged = self.clone();
        if merged.thread_id.is_none() {
            merged.thread_id = other.thread_id.clone();
        }
        if merged.parent_id.is_none() {
            merged.parent_id = other.parent_id.clone();
        }
        if merged.date.is_none() {
            merged.date = other.date;
        }
        if merged.content.as_deref().map_or(true, str::is_empty) {
            merged.content = other.content.clone();
        }
        for (key, value) in &other.metadata {
            merged
                .metadata
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        merged
    }

    /// Converts a dated fragment into an exportable entry
    pub fn into_entry(self) -> Option<Entry> {
        let date = self.date?;
        Some(Entry {
            thread_id: self.thread_id.unwrap_or_else(|| self.id.clone()),
            community: self.community,
            id: self.id,
            kind: self.kind,
            post_id: self.post_id,
            parent_id: self.parent_id,
            date,
            content: self.content.unwrap_or_default(),
            metadata: self.metadata,
        })
    }
}

/// Merges two fragments of the same entry
///
/// The higher-ranked fragment wins and is completed from the other, so
/// `merge_fragments(a, b) == merge_fragments(b, a)`.
pub fn merge_fragments(a: &PartialEntry, b: &PartialEntry) -> PartialEntry {
    if b.outranks(a) {
        b.filled_from(a)
    } else {
        a.filled_from(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn placeholder() -> PartialEntry {
        let mut c = PartialEntry::comment("ftm", "10", "200");
        c.parent_id = Some("100".to_string());
        c.thread_id = Some("100".to_string());
        c.metadata.insert("state".to_string(), "collapsed".into());
        c
    }

    fn full() -> PartialEntry {
        let mut c = PartialEntry::comment("ftm", "10", "200");
        c.date = Some(Utc.with_ymd_and_hms(2008, 3, 1, 12, 0, 0).unwrap());
        c.content = Some("hello there".to_string());
        c.metadata.insert("state".to_string(), "live".into());
        c.metadata.insert("author".to_string(), "someone".into());
        c
    }

    #[test]
    fn test_completeness_prefers_dated_bodies() {
        assert!(full().completeness() > placeholder().completeness());
    }

    #[test]
    fn test_merge_fills_gaps_from_less_complete() {
        let merged = merge_fragments(&placeholder(), &full());

        assert_eq!(merged.content.as_deref(), Some("hello there"));
        assert_eq!(merged.parent_id.as_deref(), Some("100"));
        assert_eq!(merged.thread_id.as_deref(), Some("100"));
        assert_eq!(
            merged.metadata.get("state"),
            Some(&MetadataValue::Text("live".to_string()))
        );
    }

    #[test]
    fn test_merge_is_order_independent() {
        let a = placeholder();
        let b = full();
        assert_eq!(merge_fragments(&a, &b), merge_fragments(&b, &a));

        // Equal completeness falls back to the content hash
        let mut c = placeholder();
        c.metadata.insert("state".to_string(), "deleted".into());
        assert_eq!(merge_fragments(&a, &c), merge_fragments(&c, &a));
    }

    #[test]
    fn test_merge_with_itself_is_identity() {
        let a = full();
        assert_eq!(merge_fragments(&a, &a), a);
    }

    #[test]
    fn test_ensure_id_is_stable() {
        let mut a = PartialEntry::comment("ftm", "10", "");
        a.content = Some("anonymous words".to_string());
        let mut b = a.clone();

        a.ensure_id();
        b.ensure_id();
        assert!(a.id.starts_with("h:"));
        assert_eq!(a.id, b.id);

        let mut named = PartialEntry::comment("ftm", "10", "55");
        named.ensure_id();
        assert_eq!(named.id, "55");
    }

    #[test]
    fn test_into_entry_requires_date() {
        assert!(placeholder().into_entry().is_none());

        let entry = full().into_entry().unwrap();
        assert_eq!(entry.thread_id, "200");
        assert_eq!(entry.content, "hello there");
    }

    #[test]
    fn test_metadata_serializes_untagged() {
        let mut metadata = Metadata::new();
        metadata.insert("author".to_string(), "x".into());
        metadata.insert("depth".to_string(), 2i64.into());

        let json = serde_json::to_string(&metadata).unwrap();
        assert_eq!(json, r#"{"author":"x","depth":2}"#);

        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metadata);
    }
}
