use serde::Deserialize;

/// Main configuration structure for Sumi-Corpus
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub crawler: CrawlerConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    pub output: OutputConfig,
    #[serde(default, rename = "community")]
    pub communities: Vec<CommunityConfig>,
}

impl Config {
    /// Looks up a configured community by id
    pub fn community(&self, id: &str) -> Option<&CommunityConfig> {
        self.communities.iter().find(|c| c.id == id)
    }
}

/// Crawler behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    /// Number of concurrent worker tasks
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Global ceiling on issued requests in any trailing one-second window
    #[serde(rename = "requests-per-second", default = "default_requests_per_second")]
    pub requests_per_second: u32,

    /// Token bucket burst size (must not exceed requests-per-second)
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Attempts per task before it is marked failed-permanent
    #[serde(rename = "max-attempts", default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay of the exponential retry backoff (milliseconds)
    #[serde(rename = "backoff-base-ms", default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on a single retry delay (milliseconds)
    #[serde(rename = "backoff-max-ms", default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Fraction of the backoff delay applied as random jitter
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// How long a leased task stays invisible to other workers (seconds)
    #[serde(
        rename = "visibility-timeout-secs",
        default = "default_visibility_timeout_secs"
    )]
    pub visibility_timeout_secs: u64,

    /// Age after which an in-progress frontier record is reclaimed (seconds)
    #[serde(rename = "stale-after-secs", default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Interval between background reconciliation passes (seconds)
    #[serde(
        rename = "reconcile-interval-secs",
        default = "default_reconcile_interval_secs"
    )]
    pub reconcile_interval_secs: u64,

    /// Idle wait between queue polls when no task is visible (milliseconds)
    #[serde(rename = "poll-interval-ms", default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Whole-request timeout (seconds)
    #[serde(rename = "request-timeout-secs", default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Optional Cookie header sent with every request
    #[serde(default)]
    pub cookie: Option<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: default_jitter(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            cookie: None,
        }
    }
}

fn default_workers() -> u32 {
    4
}

fn default_requests_per_second() -> u32 {
    5
}

fn default_burst() -> u32 {
    2
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_visibility_timeout_secs() -> u64 {
    120
}

fn default_stale_after_secs() -> u64 {
    300
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

impl UserAgentConfig {
    /// Formats the identification header: `Name/Version (+ContactURL; ContactEmail)`
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Path of the JSON-lines corpus export
    #[serde(rename = "export-path")]
    pub export_path: String,
}

/// A community to archive
#[derive(Debug, Clone, Deserialize)]
pub struct CommunityConfig {
    /// Short identifier used as the root of every entry key
    pub id: String,

    /// Human readable name
    #[serde(rename = "display-name")]
    pub display_name: String,

    /// Host the community is served from (e.g., "ftm.livejournal.com")
    pub host: String,

    /// Index pages the crawl starts from
    pub seeds: Vec<String>,

    /// Extra query appended to post URLs (e.g., "nojs=1")
    #[serde(rename = "entry-query", default)]
    pub entry_query: Option<String>,
}
