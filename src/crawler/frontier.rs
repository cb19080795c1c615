//! Link deduplication and frontier bookkeeping
//!
//! Every URL is keyed by its normalized form. The first discovery of a key
//! writes its frontier record and its task in one transaction; later
//! discoveries of the same key are no-ops. Status only moves forward, and a
//! terminal URL is never handed to a worker again.

use crate::crawler::queue::DispatchQueue;
use crate::state::{FrontierStatus, PageKind, PageTask};
use crate::storage::{self, SharedStorage, Storage};
use crate::url::dedup_key;
use crate::CorpusError;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Result of offering a URL to the frontier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// The URL was new and has been enqueued under this key
    New(String),
    /// The URL (or an equivalent spelling) was already known
    Duplicate,
}

/// Terminal outcome of a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    FailedPermanent,
}

impl From<Completion> for FrontierStatus {
    fn from(completion: Completion) -> Self {
        match completion {
            Completion::Done => FrontierStatus::Done,
            Completion::FailedPermanent => FrontierStatus::FailedPermanent,
        }
    }
}

/// The crawl frontier
#[derive(Clone)]
pub struct Frontier {
    storage: SharedStorage,
    queue: DispatchQueue,
    stale_after: Duration,
}

impl Frontier {
    pub fn new(storage: SharedStorage, queue: DispatchQueue, stale_after: Duration) -> Self {
        Self {
            storage,
            queue,
            stale_after,
        }
    }

    /// Offers a discovered URL
    ///
    /// # Arguments
    ///
    /// * `url` - The URL as found on the page
    /// * `kind` - The page kind the link is expected to lead to
    /// * `source` - URL of the page the link was found on, or "seed"
    /// * `community` - Id of the community the link belongs to
    /// * `now` - Discovery time
    pub fn discover(
        &self,
        url: &str,
        kind: PageKind,
        source: &str,
        community: &str,
        now: DateTime<Utc>,
    ) -> Result<Discovery, CorpusError> {
        let key = dedup_key(url);
        let task = PageTask::new(key.clone(), kind, community, source);

        let inserted = {
            let mut store = storage::lock(&self.storage)?;
            store.insert_discovered(&task, now)?
        };

        if inserted {
            tracing::trace!("Enqueued {} ({}) from {}", key, kind, source);
            Ok(Discovery::New(key))
        } else {
            Ok(Discovery::Duplicate)
        }
    }

    /// Leases up to `n` tasks and marks their URLs in progress
    ///
    /// Tasks whose URL already reached a terminal status (a redelivery racing
    /// a completion) are acknowledged and dropped instead of being returned.
    pub fn lease(&self, n: usize, now: DateTime<Utc>) -> Result<Vec<PageTask>, CorpusError> {
        let leased = self.queue.lease(n, now)?;
        let mut tasks = Vec::with_capacity(leased.len());

        for task in leased {
            let status = {
                let store = storage::lock(&self.storage)?;
                store.get_frontier(&task.url)?.map(|record| record.status)
            };

            match status {
                Some(status) if status.is_terminal() => {
                    tracing::debug!("Dropping redelivered task for {} ({})", task.url, status);
                    self.queue.ack(&task)?;
                }
                Some(status) => {
                    if status.can_transition_to(FrontierStatus::InProgress) {
                        let mut store = storage::lock(&self.storage)?;
                        store.set_frontier_status(&task.url, FrontierStatus::InProgress, now)?;
                    }
                    tasks.push(task);
                }
                None => tasks.push(task),
            }
        }

        Ok(tasks)
    }

    /// Records the terminal outcome of a URL
    ///
    /// # Returns
    ///
    /// `true` if the status changed; a URL that is already terminal keeps its
    /// first outcome.
    pub fn complete(
        &self,
        url: &str,
        outcome: Completion,
        now: DateTime<Utc>,
    ) -> Result<bool, CorpusError> {
        let target = FrontierStatus::from(outcome);
        let mut store = storage::lock(&self.storage)?;

        match store.get_frontier(url)? {
            Some(record) if record.status.can_transition_to(target) => {
                store.set_frontier_status(url, target, now)?;
                Ok(true)
            }
            Some(record) => {
                tracing::debug!(
                    "Ignoring {} for {}: already {}",
                    target,
                    url,
                    record.status
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Re-queues URLs stuck in progress beyond the staleness timeout
    ///
    /// A task is re-created only when none is queued for the URL; a task that
    /// still exists is already covered by its visibility timeout.
    ///
    /// # Returns
    ///
    /// The number of URLs re-queued.
    pub fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<usize, CorpusError> {
        let cutoff = now - chrono::Duration::from_std(self.stale_after).unwrap_or_default();
        let mut store = storage::lock(&self.storage)?;
        let stale = store.stale_in_progress(cutoff)?;

        let mut reclaimed = 0;
        for record in stale {
            let task = PageTask::new(
                record.url.clone(),
                record.kind,
                &record.community,
                &record.source,
            );
            if store.insert_task(&task, now)? {
                tracing::info!("Reclaimed stale task for {}", record.url);
                reclaimed += 1;
            }
            // Refresh the timestamp so the record is not reclaimed every pass
            store.set_frontier_status(&record.url, FrontierStatus::InProgress, now)?;
        }

        Ok(reclaimed)
    }

    /// Gets the current status of a URL, looked up by its dedup key
    pub fn status(&self, url: &str) -> Result<Option<FrontierStatus>, CorpusError> {
        let store = storage::lock(&self.storage)?;
        Ok(store.get_frontier(&dedup_key(url))?.map(|record| record.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{share, SqliteStorage};

    fn frontier() -> (Frontier, DispatchQueue) {
        let storage = share(SqliteStorage::new_in_memory().unwrap());
        let queue = DispatchQueue::new(storage.clone(), Duration::from_secs(60));
        (
            Frontier::new(storage, queue.clone(), Duration::from_secs(300)),
            queue,
        )
    }

    #[test]
    fn test_discover_is_idempotent_across_spellings() {
        let (frontier, queue) = frontier();
        let now = Utc::now();

        let first = frontier
            .discover("https://ftm.livejournal.com/1.html", PageKind::Post, "seed", "ftm", now)
            .unwrap();
        assert_eq!(
            first,
            Discovery::New("https://ftm.livejournal.com/1.html".to_string())
        );

        for spelling in [
            "https://ftm.livejournal.com/1.html",
            "https://WWW.ftm.livejournal.com/1.html#comments",
            "https://ftm.livejournal.com/1.html?utm_source=feed",
        ] {
            let again = frontier
                .discover(spelling, PageKind::Post, "seed", "ftm", now)
                .unwrap();
            assert_eq!(again, Discovery::Duplicate);
        }

        assert_eq!(queue.outstanding().unwrap(), 1);
        assert_eq!(
            frontier.status("https://ftm.livejournal.com/1.html").unwrap(),
            Some(FrontierStatus::Enqueued)
        );
    }

    #[test]
    fn test_done_url_is_never_released() {
        let (frontier, queue) = frontier();
        let now = Utc::now();
        frontier
            .discover("https://ftm.livejournal.com/1.html", PageKind::Post, "seed", "ftm", now)
            .unwrap();

        let tasks = frontier.lease(1, now).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            frontier.status(&tasks[0].url).unwrap(),
            Some(FrontierStatus::InProgress)
        );

        // Complete without acking, as if the worker died before the ack
        assert!(frontier.complete(&tasks[0].url, Completion::Done, now).unwrap());

        let later = now + chrono::Duration::seconds(120);
        assert!(frontier.lease(1, later).unwrap().is_empty());
        assert_eq!(queue.outstanding().unwrap(), 0);
    }

    #[test]
    fn test_complete_is_monotonic() {
        let (frontier, _) = frontier();
        let now = Utc::now();
        frontier
            .discover("https://ftm.livejournal.com/2.html", PageKind::Post, "seed", "ftm", now)
            .unwrap();
        let url = "https://ftm.livejournal.com/2.html";

        assert!(frontier.complete(url, Completion::Done, now).unwrap());
        assert!(!frontier
            .complete(url, Completion::FailedPermanent, now)
            .unwrap());
        assert_eq!(frontier.status(url).unwrap(), Some(FrontierStatus::Done));
    }

    #[test]
    fn test_reclaim_stale_requeues_lost_task() {
        let (frontier, queue) = frontier();
        let start = Utc::now();
        frontier
            .discover("https://ftm.livejournal.com/3.html", PageKind::Post, "seed", "ftm", start)
            .unwrap();

        let tasks = frontier.lease(1, start).unwrap();
        // The task vanished without an ack or a terminal status
        queue.ack(&tasks[0]).unwrap();

        let soon = start + chrono::Duration::seconds(10);
        assert_eq!(frontier.reclaim_stale(soon).unwrap(), 0);

        let late = start + chrono::Duration::seconds(301);
        assert_eq!(frontier.reclaim_stale(late).unwrap(), 1);
        assert_eq!(queue.outstanding().unwrap(), 1);

        let again = frontier.lease(1, late).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].url, "https://ftm.livejournal.com/3.html");
    }
}
