//! Page kinds and the unit of work handed to workers

use std::fmt;

/// The kind of archive page a URL is expected to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    /// Community index listing post links
    Index,
    /// A single post with its first page of comments
    Post,
    /// An expanded comment thread or a further page of comments
    CommentThread,
}

impl PageKind {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Post => "post",
            Self::CommentThread => "comment_thread",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "index" => Some(Self::Index),
            "post" => Some(Self::Post),
            "comment_thread" => Some(Self::CommentThread),
            _ => None,
        }
    }
}

impl fmt::Display for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// One fetch-and-parse unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTask {
    /// Normalized URL (the frontier key)
    pub url: String,
    pub kind: PageKind,
    /// Id of the community the page belongs to
    pub community: String,
    /// URL of the page the link was found on, or "seed"
    pub source: String,
    /// Failed attempts so far
    pub attempt: u32,
}

impl PageTask {
    pub fn new(url: impl Into<String>, kind: PageKind, community: &str, source: &str) -> Self {
        Self {
            url: url.into(),
            kind,
            community: community.to_string(),
            source: source.to_string(),
            attempt: 0,
        }
    }
}
