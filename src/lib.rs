//! Sumi-Corpus: an archive crawler for threaded community journals
//!
//! This crate walks community index pages, posts and comment threads, and
//! reassembles the scraped fragments into a chronologically ordered corpus
//! of posts, comments and nested replies stored in SQLite.

pub mod config;
pub mod corpus;
pub mod crawler;
pub mod output;
pub mod state;
pub mod storage;
pub mod url;

use thiserror::Error;

/// Main error type for Sumi-Corpus operations
#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    StorageError(#[from] storage::StorageError),

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Rate limit budget exhausted")]
    RateLimitExhausted,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid host: {0}")]
    InvalidHost(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing host in URL")]
    MissingHost,

    #[error("Malformed URL: {0}")]
    Malformed(String),
}

/// Outcome classes of a failed fetch
///
/// Transient failures go back through the retry policy; permanent ones are
/// recorded immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient failure fetching {url}: {reason}")]
    Transient { url: String, reason: String },

    #[error("permanent failure fetching {url}: {reason}")]
    Permanent { url: String, reason: String },
}

impl FetchError {
    /// Returns true if the fetch may succeed when retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// The URL the failure belongs to
    pub fn url(&self) -> &str {
        match self {
            Self::Transient { url, .. } | Self::Permanent { url, .. } => url,
        }
    }
}

/// A page that produced nothing usable for its assumed kind
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("could not parse {url} as {kind} page: {message}")]
pub struct ParseError {
    pub url: String,
    pub kind: String,
    pub message: String,
}

/// Result type alias for Sumi-Corpus operations
pub type Result<T> = std::result::Result<T, CorpusError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::Config;
pub use corpus::{Entry, EntryKind, PartialEntry};
pub use state::{FrontierStatus, PageKind, PageTask};
pub use url::{dedup_key, normalize_url};
