//! Configuration module for Sumi-Corpus
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use sumi_corpus::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("config.toml")).unwrap();
//! println!("Crawler budget: {} req/s", config.crawler.requests_per_second);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{CommunityConfig, Config, CrawlerConfig, OutputConfig, UserAgentConfig};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
