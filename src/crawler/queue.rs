//! Durable dispatch queue and retry policy
//!
//! Tasks live in the `tasks` table until acknowledged. Leasing hides a task
//! for the visibility timeout instead of removing it, so a worker that dies
//! mid-task only delays the task; delivery is at-least-once.

use crate::config::CrawlerConfig;
use crate::state::PageTask;
use crate::storage::{self, FailureRecord, SharedStorage, Storage};
use crate::CorpusError;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// What to do with a task after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Exponential backoff with jitter and a bounded attempt count
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
    /// Fraction of the delay added or removed at random, in `0.0..=1.0`
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            max_attempts: config.max_attempts,
            jitter: config.jitter,
        }
    }

    /// Decides the fate of a task that has just failed
    ///
    /// # Arguments
    ///
    /// * `failed_before` - Failed attempts before the one that just failed
    ///
    /// # Returns
    ///
    /// `GiveUp` once `max_attempts` attempts have failed, otherwise the delay
    /// before the task becomes visible again: `base * 2^failed_before`, capped
    /// at `max`, then moved by up to `jitter` of itself in either direction.
    pub fn decide(&self, failed_before: u32) -> RetryDecision {
        if failed_before.saturating_add(1) >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.jittered(self.backoff(failed_before)))
    }

    /// Backoff before jitter
    pub fn backoff(&self, failed_before: u32) -> Duration {
        let factor = 1u32.checked_shl(failed_before).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter.min(1.0);
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }
}

/// At-least-once work queue over the shared store
#[derive(Clone)]
pub struct DispatchQueue {
    storage: SharedStorage,
    visibility: Duration,
}

impl DispatchQueue {
    pub fn new(storage: SharedStorage, visibility: Duration) -> Self {
        Self {
            storage,
            visibility,
        }
    }

    /// Adds a task, visible immediately
    ///
    /// # Returns
    ///
    /// `false` if a task for the same URL is already queued.
    pub fn enqueue(&self, task: &PageTask, now: DateTime<Utc>) -> Result<bool, CorpusError> {
        let mut store = storage::lock(&self.storage)?;
        Ok(store.insert_task(task, now)?)
    }

    /// Leases up to `n` visible tasks for the visibility timeout
    pub fn lease(&self, n: usize, now: DateTime<Utc>) -> Result<Vec<PageTask>, CorpusError> {
        let hidden_until = now + chrono::Duration::from_std(self.visibility).unwrap_or_default();
        let mut store = storage::lock(&self.storage)?;
        Ok(store.lease_tasks(now, hidden_until, n)?)
    }

    /// Removes a finished task
    pub fn ack(&self, task: &PageTask) -> Result<(), CorpusError> {
        let mut store = storage::lock(&self.storage)?;
        store.delete_task(&task.url)?;
        Ok(())
    }

    /// Returns a task for another attempt after `retry_after`
    pub fn nack(&self, task: &PageTask, retry_after: Duration, error: &str) -> Result<(), CorpusError> {
        let visible_at = Utc::now() + chrono::Duration::from_std(retry_after).unwrap_or_default();
        let mut store = storage::lock(&self.storage)?;
        store.retry_task(&task.url, visible_at, error)?;
        tracing::debug!(
            "Retrying {} in {:.1}s (attempt {} failed: {})",
            task.url,
            retry_after.as_secs_f64(),
            task.attempt + 1,
            error
        );
        Ok(())
    }

    /// Removes a task and puts it on the failure list
    pub fn fail(&self, task: &PageTask, class: &str, message: &str) -> Result<(), CorpusError> {
        let failure = FailureRecord {
            url: task.url.clone(),
            community: task.community.clone(),
            kind: Some(task.kind),
            attempts: task.attempt + 1,
            error_class: class.to_string(),
            message: message.to_string(),
            failed_at: Utc::now(),
        };

        let mut store = storage::lock(&self.storage)?;
        store.delete_task(&task.url)?;
        store.record_failure(&failure)?;
        Ok(())
    }

    /// Live tasks, leased or waiting; zero means the crawl is finished
    pub fn outstanding(&self) -> Result<u64, CorpusError> {
        let store = storage::lock(&self.storage)?;
        Ok(store.count_tasks()?)
    }

    /// When the next hidden task becomes visible, if any
    pub fn next_visible_at(&self) -> Result<Option<DateTime<Utc>>, CorpusError> {
        let store = storage::lock(&self.storage)?;
        Ok(store.next_visible_at()?)
    }
}
