//! Crawler coordinator - main crawl orchestration logic
//!
//! This module contains the crawl loop that coordinates:
//! - Opening storage and creating or resuming a run
//! - Seeding the frontier with every community's index pages
//! - A fixed pool of workers leasing tasks from the dispatch queue
//! - A background reconciler for dangling references and stale tasks
//! - Retry, failure and interrupt handling

use crate::config::Config;
use crate::corpus::{Assembler, MergeOutcome, ReconcileReport};
use crate::crawler::fetcher::{build_http_client, Fetcher};
use crate::crawler::frontier::{Completion, Discovery, Frontier};
use crate::crawler::parser::{parse_page, ParseResult};
use crate::crawler::queue::{DispatchQueue, RetryDecision, RetryPolicy};
use crate::crawler::rate_limiter::RateLimiter;
use crate::state::PageTask;
use crate::storage::{self, FailureRecord, RunStatus, SharedStorage, SqliteStorage, Storage};
use crate::url::classify_page_url;
use crate::CorpusError;
use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use url::Url;

/// Error class recorded for references still unresolved after a crawl
pub const DANGLING_CLASS: &str = "dangling_reference";

/// Consecutive storage errors after which a worker stops
const MAX_WORKER_ERRORS: u32 = 10;

/// Totals of a finished crawl
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    pub run_id: i64,
    pub pages_done: u64,
    pub pages_failed: u64,
    pub retries: u64,
    pub entries_merged: u64,
    pub entries_changed: u64,
    pub links_new: u64,
    pub dangling_unresolved: u64,
    pub interrupted: bool,
    pub elapsed: Duration,
}

#[derive(Default)]
struct Counters {
    pages_done: AtomicU64,
    pages_failed: AtomicU64,
    retries: AtomicU64,
    entries_merged: AtomicU64,
    entries_changed: AtomicU64,
    links_new: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Everything a worker needs, cloned into each worker task
#[derive(Clone)]
struct WorkerContext {
    config: Arc<Config>,
    fetcher: Fetcher,
    assembler: Assembler,
    frontier: Frontier,
    queue: DispatchQueue,
    retry: RetryPolicy,
    counters: Arc<Counters>,
    shutdown: watch::Receiver<bool>,
}

/// Main crawler coordinator structure
pub struct Coordinator {
    config: Arc<Config>,
    storage: SharedStorage,
    fetcher: Fetcher,
    assembler: Assembler,
    frontier: Frontier,
    queue: DispatchQueue,
    run_id: i64,
}

impl Coordinator {
    /// Creates a new coordinator instance
    ///
    /// # Arguments
    ///
    /// * `config` - The crawler configuration
    /// * `config_hash` - Hash of the config file, recorded on the run
    /// * `fresh` - Whether to clear frontier, queue and failure state first
    ///
    /// # Returns
    ///
    /// * `Ok(Coordinator)` - Storage opened and frontier seeded
    /// * `Err(CorpusError)` - Failed to initialize
    pub fn new(config: Config, config_hash: &str, fresh: bool) -> Result<Self, CorpusError> {
        let storage_path = Path::new(&config.output.database_path);
        let mut storage = SqliteStorage::new(storage_path)?;

        let run_id = if fresh {
            tracing::info!("Clearing crawl state for a fresh run");
            storage.clear_crawl_state()?;
            storage.create_run(config_hash)?
        } else {
            match storage.get_latest_run()? {
                Some(latest) if latest.status == RunStatus::Running => {
                    tracing::info!("Resuming interrupted run {}", latest.id);
                    latest.id
                }
                Some(latest) if latest.status == RunStatus::Interrupted => {
                    tracing::info!("Resuming interrupted run {}", latest.id);
                    storage.update_run_status(latest.id, RunStatus::Running)?;
                    latest.id
                }
                _ => {
                    tracing::info!("Starting new run");
                    storage.create_run(config_hash)?
                }
            }
        };

        Self::with_storage(config, storage::share(storage), run_id)
    }

    /// Builds a coordinator over already-open storage and seeds the frontier
    pub fn with_storage(
        config: Config,
        storage: SharedStorage,
        run_id: i64,
    ) -> Result<Self, CorpusError> {
        let crawler = &config.crawler;
        let client = build_http_client(&config.user_agent, crawler)?;
        let limiter = Arc::new(RateLimiter::new(crawler.requests_per_second, crawler.burst));
        let fetcher = Fetcher::new(client, limiter);

        let queue = DispatchQueue::new(
            storage.clone(),
            Duration::from_secs(crawler.visibility_timeout_secs),
        );
        let frontier = Frontier::new(
            storage.clone(),
            queue.clone(),
            Duration::from_secs(crawler.stale_after_secs),
        );
        let assembler = Assembler::new(storage.clone());

        let coordinator = Self {
            config: Arc::new(config),
            storage,
            fetcher,
            assembler,
            frontier,
            queue,
            run_id,
        };
        coordinator.seed()?;

        Ok(coordinator)
    }

    /// Offers every configured seed to the frontier; known seeds are no-ops
    fn seed(&self) -> Result<(), CorpusError> {
        let now = Utc::now();
        let mut seeded = 0;

        for community in &self.config.communities {
            for seed in &community.seeds {
                let kind = match Url::parse(seed) {
                    Ok(url) => classify_page_url(&url),
                    Err(e) => {
                        tracing::warn!("Skipping unparseable seed {}: {}", seed, e);
                        continue;
                    }
                };
                if let Discovery::New(_) =
                    self.frontier.discover(seed, kind, "seed", &community.id, now)?
                {
                    seeded += 1;
                }
            }
        }

        tracing::info!(
            "Seeded {} new URLs across {} communities",
            seeded,
            self.config.communities.len()
        );
        Ok(())
    }

    /// The run this coordinator records into
    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    /// Runs the crawl until no task is outstanding or the process is interrupted
    ///
    /// Spawns `workers` worker tasks and a reconciler. When the workers stop,
    /// a final reconciliation pass runs and every reference still dangling is
    /// recorded on the failure list.
    pub async fn run(&self) -> Result<CrawlReport, CorpusError> {
        tracing::info!(
            "Starting crawl run {} with {} workers at {} req/s",
            self.run_id,
            self.config.crawler.workers,
            self.config.crawler.requests_per_second
        );

        let start_time = Instant::now();
        let counters = Arc::new(Counters::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let context = WorkerContext {
            config: self.config.clone(),
            fetcher: self.fetcher.clone(),
            assembler: self.assembler.clone(),
            frontier: self.frontier.clone(),
            queue: self.queue.clone(),
            retry: RetryPolicy::from_config(&self.config.crawler),
            counters: counters.clone(),
            shutdown: shutdown_rx.clone(),
        };

        let reconciler = tokio::spawn(reconcile_loop(
            self.assembler.clone(),
            self.frontier.clone(),
            Duration::from_secs(self.config.crawler.reconcile_interval_secs),
            shutdown_rx,
        ));

        let workers: Vec<_> = (0..self.config.crawler.workers)
            .map(|id| tokio::spawn(worker_loop(id, context.clone())))
            .collect();

        let interrupt_tx = shutdown_tx.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping workers after their current task");
                let _ = interrupt_tx.send(true);
            }
        });

        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!("Worker task failed: {}", e);
            }
        }

        let interrupted = *shutdown_tx.borrow();
        interrupt.abort();
        let _ = shutdown_tx.send(true);
        if let Err(e) = reconciler.await {
            tracing::error!("Reconciler task failed: {}", e);
        }

        let final_pass = self.assembler.reconcile()?;
        let dangling_unresolved = if interrupted {
            0
        } else {
            self.report_unresolved(&final_pass)?
        };

        {
            let mut store = storage::lock(&self.storage)?;
            if interrupted {
                store.update_run_status(self.run_id, RunStatus::Interrupted)?;
            } else {
                store.complete_run(self.run_id)?;
            }
        }

        let report = CrawlReport {
            run_id: self.run_id,
            pages_done: counters.pages_done.load(Ordering::Relaxed),
            pages_failed: counters.pages_failed.load(Ordering::Relaxed),
            retries: counters.retries.load(Ordering::Relaxed),
            entries_merged: counters.entries_merged.load(Ordering::Relaxed),
            entries_changed: counters.entries_changed.load(Ordering::Relaxed),
            links_new: counters.links_new.load(Ordering::Relaxed),
            dangling_unresolved,
            interrupted,
            elapsed: start_time.elapsed(),
        };

        tracing::info!(
            "Crawl {}: {} pages done, {} failed, {} entries merged in {:?}",
            if interrupted { "interrupted" } else { "completed" },
            report.pages_done,
            report.pages_failed,
            report.entries_merged,
            report.elapsed
        );

        Ok(report)
    }

    /// Moves references the crawl never resolved onto the failure list
    ///
    /// The rows of earlier runs are replaced, so each open reference is
    /// listed once however many runs have ended with it.
    fn report_unresolved(&self, final_pass: &ReconcileReport) -> Result<u64, CorpusError> {
        let mut store = storage::lock(&self.storage)?;
        let cleared = store.clear_failures(DANGLING_CLASS)?;
        if final_pass.remaining == 0 {
            if cleared > 0 {
                tracing::info!("Cleared {} previously unresolved references", cleared);
            }
            return Ok(0);
        }

        let dangling = store.list_dangling()?;
        let now = Utc::now();

        for record in &dangling {
            tracing::warn!(
                "Unresolved {} reference: {}/{}/{} -> {}",
                record.reason.to_db_string(),
                record.community,
                record.post_id,
                record.entry_id,
                record.target_id
            );
            store.record_failure(&FailureRecord {
                url: format!("{}/{}/{}", record.community, record.post_id, record.entry_id),
                community: record.community.clone(),
                kind: None,
                attempts: 0,
                error_class: DANGLING_CLASS.to_string(),
                message: format!(
                    "{} {} was never stored",
                    record.reason.to_db_string(),
                    record.target_id
                ),
                failed_at: now,
            })?;
        }

        Ok(dangling.len() as u64)
    }
}

/// Leases and processes tasks until the queue drains or shutdown is signalled
async fn worker_loop(id: u32, ctx: WorkerContext) {
    let poll = Duration::from_millis(ctx.config.crawler.poll_interval_ms);
    let mut errors = 0;

    loop {
        if *ctx.shutdown.borrow() {
            tracing::debug!("Worker {} stopping on shutdown", id);
            break;
        }

        let leased = ctx.frontier.lease(1, Utc::now());
        let task = match leased {
            Ok(mut tasks) => {
                errors = 0;
                tasks.pop()
            }
            Err(e) => {
                errors += 1;
                tracing::error!("Worker {} failed to lease a task: {}", id, e);
                if errors >= MAX_WORKER_ERRORS {
                    tracing::error!("Worker {} giving up after {} storage errors", id, errors);
                    break;
                }
                tokio::time::sleep(poll).await;
                continue;
            }
        };

        match task {
            Some(task) => process_task(&ctx, task).await,
            None => match ctx.queue.outstanding() {
                Ok(0) => {
                    tracing::debug!("Worker {} found the queue drained", id);
                    break;
                }
                Ok(_) => tokio::time::sleep(poll).await,
                Err(e) => {
                    tracing::error!("Worker {} failed to count tasks: {}", id, e);
                    tokio::time::sleep(poll).await;
                }
            },
        }
    }
}

/// Fetches, parses and persists one task, then settles it in the queue
async fn process_task(ctx: &WorkerContext, task: PageTask) {
    tracing::debug!("Processing {} ({}, attempt {})", task.url, task.kind, task.attempt + 1);

    let Some(community) = ctx.config.community(&task.community) else {
        let message = format!("no community {}", task.community);
        settle_failure(ctx, &task, "unknown_community", &message, false, 0);
        return;
    };

    let page = match ctx.fetcher.fetch(&task.url).await {
        Ok(page) => page,
        Err(e) if e.is_transient() => {
            settle_failure(ctx, &task, "transient", &e.to_string(), true, 0);
            return;
        }
        Err(e) => {
            settle_failure(ctx, &task, "permanent", &e.to_string(), false, 0);
            return;
        }
    };

    let parsed = match parse_page(&page, task.kind, community) {
        Ok(parsed) => parsed,
        Err(e) => {
            settle_failure(ctx, &task, "parse", &e.to_string(), false, 0);
            return;
        }
    };

    if let Err(e) = persist(ctx, &task, &parsed) {
        settle_failure(ctx, &task, "persistence", &e.to_string(), true, parsed.entries.len());
        return;
    }

    Counters::bump(&ctx.counters.pages_done, 1);
}

/// Writes a page's fragments and links, then marks the URL done
///
/// Every step is idempotent, so a redelivered task replays safely.
fn persist(ctx: &WorkerContext, task: &PageTask, parsed: &ParseResult) -> Result<(), CorpusError> {
    let now = Utc::now();

    for fragment in &parsed.entries {
        let merged = ctx.assembler.merge(fragment.clone())?;
        Counters::bump(&ctx.counters.entries_merged, 1);
        if merged.outcome != MergeOutcome::Unchanged {
            Counters::bump(&ctx.counters.entries_changed, 1);
        }
        for dangling in &merged.dangling {
            tracing::debug!(
                "Dangling {} reference from {}/{} to {}",
                dangling.reason.to_db_string(),
                dangling.post_id,
                dangling.entry_id,
                dangling.target_id
            );
        }
    }

    for link in &parsed.links {
        if let Discovery::New(_) =
            ctx.frontier
                .discover(&link.url, link.kind, &task.url, &task.community, now)?
        {
            Counters::bump(&ctx.counters.links_new, 1);
        }
    }

    ctx.frontier.complete(&task.url, Completion::Done, now)?;
    ctx.queue.ack(task)?;
    Ok(())
}

/// Retries a failed task or moves it to the failure list
///
/// # Arguments
///
/// * `class` - Failure class recorded on the failure list
/// * `retryable` - Whether the retry policy applies
/// * `lost_entries` - Parsed entries that will be lost if the task gives up
fn settle_failure(
    ctx: &WorkerContext,
    task: &PageTask,
    class: &str,
    message: &str,
    retryable: bool,
    lost_entries: usize,
) {
    if retryable {
        if let RetryDecision::RetryAfter(delay) = ctx.retry.decide(task.attempt) {
            match ctx.queue.nack(task, delay, message) {
                Ok(()) => Counters::bump(&ctx.counters.retries, 1),
                // The lease will expire and the task comes back anyway
                Err(e) => tracing::error!("Failed to reschedule {}: {}", task.url, e),
            }
            return;
        }
    }

    if lost_entries > 0 {
        tracing::error!(
            "Lost {} parsed entries from {} after {} attempts: {}",
            lost_entries,
            task.url,
            task.attempt + 1,
            message
        );
    } else {
        tracing::warn!("Giving up on {} ({}): {}", task.url, class, message);
    }

    let settled = ctx
        .frontier
        .complete(&task.url, Completion::FailedPermanent, Utc::now())
        .and_then(|_| ctx.queue.fail(task, class, message));
    match settled {
        Ok(()) => Counters::bump(&ctx.counters.pages_failed, 1),
        Err(e) => tracing::error!("Failed to record failure of {}: {}", task.url, e),
    }
}

/// Periodically reconciles dangling references and reclaims stale tasks
async fn reconcile_loop(
    assembler: Assembler,
    frontier: Frontier,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match assembler.reconcile() {
                    Ok(report) if report.resolved > 0 => {
                        tracing::debug!("Reconciled {} references", report.resolved);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Reconciliation failed: {}", e),
                }
                if let Err(e) = frontier.reclaim_stale(Utc::now()) {
                    tracing::error!("Stale task reclaim failed: {}", e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Runs a complete crawl operation
///
/// # Arguments
///
/// * `config` - The crawler configuration
/// * `config_hash` - Hash of the config file, recorded on the run
/// * `fresh` - Whether to start from a cleared frontier
///
/// # Returns
///
/// * `Ok(CrawlReport)` - Crawl finished or was interrupted cleanly
/// * `Err(CorpusError)` - Crawl failed
///
/// # Example
///
/// ```no_run
/// use sumi_corpus::config::load_config_with_hash;
/// use sumi_corpus::crawler::run_crawl;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (config, hash) = load_config_with_hash(Path::new("config.toml"))?;
/// let report = run_crawl(config, &hash, false).await?;
/// println!("{} pages done", report.pages_done);
/// # Ok(())
/// # }
/// ```
pub async fn run_crawl(
    config: Config,
    config_hash: &str,
    fresh: bool,
) -> Result<CrawlReport, CorpusError> {
    let coordinator = Coordinator::new(config, config_hash, fresh)?;
    coordinator.run().await
}
