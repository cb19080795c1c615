//! Crawler module for archive fetching and processing
//!
//! This module contains the core crawling logic, including:
//! - A global rate limiter shared by every request
//! - HTTP fetching with transient/permanent outcome classification
//! - Page parsing into entry fragments and typed links
//! - The deduplicating frontier and the durable dispatch queue
//! - Overall crawl coordination

mod coordinator;
mod dates;
mod fetcher;
mod frontier;
mod parser;
mod queue;
mod rate_limiter;

pub use coordinator::{run_crawl, Coordinator, CrawlReport, DANGLING_CLASS};
pub use dates::parse_date;
pub use fetcher::{build_http_client, classify_status, Fetcher, RawPage};
pub use frontier::{Completion, Discovery, Frontier};
pub use parser::{parse_page, DiscoveredLink, ParseResult};
pub use queue::{DispatchQueue, RetryDecision, RetryPolicy};
pub use rate_limiter::{Permit, RateLimiter};
