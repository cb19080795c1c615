//! Sumi-Corpus main entry point
//!
//! This is the command-line interface for the Sumi-Corpus archive crawler.

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use sumi_corpus::config::{load_config_with_hash, Config};
use sumi_corpus::crawler::run_crawl;
use sumi_corpus::output::{export_to_path, load_statistics, print_failures, print_statistics};
use sumi_corpus::storage::{SqliteStorage, Storage};
use tracing_subscriber::EnvFilter;

/// Sumi-Corpus: an archive crawler for threaded community journals
///
/// Sumi-Corpus walks community index pages, posts and comment threads under
/// a global request budget and reassembles them into an ordered corpus of
/// posts, comments and nested replies.
#[derive(Parser, Debug)]
#[command(name = "sumi-corpus")]
#[command(version)]
#[command(about = "An archive crawler for threaded community journals", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Start a fresh crawl, clearing frontier, queue and failures (entries are kept)
    #[arg(long)]
    fresh: bool,

    /// Validate config and show what would be crawled without actually crawling
    #[arg(long, conflicts_with_all = ["stats", "export", "failures"])]
    dry_run: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with_all = ["dry_run", "export", "failures"])]
    stats: bool,

    /// Export entries as JSON lines and exit (defaults to the configured export path)
    #[arg(long, value_name = "PATH", num_args = 0..=1, conflicts_with_all = ["dry_run", "stats", "failures"])]
    export: Option<Option<PathBuf>>,

    /// Restrict the export to one community id
    #[arg(long, value_name = "ID", requires = "export")]
    community: Option<String>,

    /// Show the failure list and exit
    #[arg(long, conflicts_with_all = ["dry_run", "stats", "export"])]
    failures: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config)?;
    } else if let Some(path) = cli.export {
        handle_export(&config, path, cli.community.as_deref())?;
    } else if cli.failures {
        handle_failures(&config)?;
    } else {
        handle_crawl(config, &config_hash, cli.fresh).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_corpus=info,warn"),
            1 => EnvFilter::new("sumi_corpus=debug,info"),
            2 => EnvFilter::new("sumi_corpus=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn open_existing(config: &Config) -> anyhow::Result<SqliteStorage> {
    let path = Path::new(&config.output.database_path);
    SqliteStorage::new(path).with_context(|| format!("opening database {}", path.display()))
}

/// Handles the --dry-run mode: validates config and shows what would be crawled
fn handle_dry_run(config: &Config) {
    println!("=== Sumi-Corpus Dry Run ===\n");

    let crawler = &config.crawler;
    println!("Crawler Configuration:");
    println!("  Workers: {}", crawler.workers);
    println!(
        "  Request budget: {} req/s (burst {})",
        crawler.requests_per_second, crawler.burst
    );
    println!(
        "  Retries: {} attempts, backoff {}ms..{}ms, jitter {:.0}%",
        crawler.max_attempts,
        crawler.backoff_base_ms,
        crawler.backoff_max_ms,
        crawler.jitter * 100.0
    );
    println!(
        "  Visibility timeout: {}s, stale after: {}s",
        crawler.visibility_timeout_secs, crawler.stale_after_secs
    );
    println!("  Cookie: {}", if crawler.cookie.is_some() { "set" } else { "none" });

    println!("\nUser Agent:");
    println!("  {}", config.user_agent.header_value());

    println!("\nOutput:");
    println!("  Database: {}", config.output.database_path);
    println!("  Export: {}", config.output.export_path);

    println!("\nCommunities ({}):", config.communities.len());
    for community in &config.communities {
        println!(
            "  - {} ({}, {} seeds)",
            community.id,
            community.host,
            community.seeds.len()
        );
        for seed in &community.seeds {
            println!("    * {}", seed);
        }
    }

    println!("\n✓ Configuration is valid");
    println!(
        "✓ Would start crawling with {} seed URLs",
        config.communities.iter().map(|c| c.seeds.len()).sum::<usize>()
    );
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.output.database_path);

    let storage = open_existing(config)?;
    let stats = load_statistics(&storage)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the --export mode: writes entries as JSON lines
fn handle_export(
    config: &Config,
    path: Option<PathBuf>,
    community: Option<&str>,
) -> anyhow::Result<()> {
    if let Some(id) = community {
        if config.community(id).is_none() {
            anyhow::bail!("community '{}' is not configured", id);
        }
    }

    let path = path.unwrap_or_else(|| PathBuf::from(&config.output.export_path));
    let storage = open_existing(config)?;

    let written = export_to_path(&storage, community, &path)
        .with_context(|| format!("exporting to {}", path.display()))?;

    println!("✓ Exported {} entries to: {}", written, path.display());
    Ok(())
}

/// Handles the --failures mode: prints the failure list
fn handle_failures(config: &Config) -> anyhow::Result<()> {
    let storage = open_existing(config)?;
    print_failures(&storage.list_failures()?);
    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(config: Config, config_hash: &str, fresh: bool) -> anyhow::Result<()> {
    if fresh {
        tracing::info!("Starting fresh crawl (frontier and failures cleared)");
    } else {
        tracing::info!("Starting crawl (will resume if interrupted run exists)");
    }

    let seed_count: usize = config.communities.iter().map(|c| c.seeds.len()).sum();
    tracing::info!(
        "Communities: {}, seed URLs: {}",
        config.communities.len(),
        seed_count
    );

    let report = match run_crawl(config, config_hash, fresh).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            return Err(e.into());
        }
    };

    println!("=== Crawl {} ===", if report.interrupted { "Interrupted" } else { "Complete" });
    println!("  Run: {}", report.run_id);
    println!("  Pages done: {}", report.pages_done);
    println!("  Pages failed: {}", report.pages_failed);
    println!("  Retries: {}", report.retries);
    println!(
        "  Entries merged: {} ({} changed)",
        report.entries_merged, report.entries_changed
    );
    println!("  New links: {}", report.links_new);
    if report.dangling_unresolved > 0 {
        println!("  Unresolved references: {}", report.dangling_unresolved);
    }
    println!("  Elapsed: {:.1}s", report.elapsed.as_secs_f64());

    Ok(())
}
