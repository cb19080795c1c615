//! Global request budget shared by every worker
//!
//! Three layers issue a permit:
//! - a semaphore bounding requests in flight
//! - a token bucket (`governor`) smoothing the request rate with a small burst
//! - a trailing one-second log that refuses a request if the ceiling was
//!   already reached inside the last second
//!
//! The token bucket alone lets `burst + rate` requests through a single
//! window; the log keeps the ceiling strict.

use crate::CorpusError;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Governor};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const WINDOW: Duration = Duration::from_secs(1);

type DirectLimiter = Governor<NotKeyed, InMemoryState, DefaultClock>;

/// Permission to issue one request; dropping it frees the in-flight slot
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    issued_at: Instant,
}

impl Permit {
    /// When the request was admitted into the window
    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }
}

/// Process-wide request budget
pub struct RateLimiter {
    in_flight: Arc<Semaphore>,
    bucket: DirectLimiter,
    window: Mutex<VecDeque<Instant>>,
    per_second: usize,
}

impl RateLimiter {
    /// Creates a limiter allowing `per_second` requests in any trailing second
    ///
    /// Zero values are raised to one; `burst` is capped at `per_second`.
    pub fn new(per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst.min(rate.get())).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rate).allow_burst(burst);

        Self {
            in_flight: Arc::new(Semaphore::new(rate.get() as usize)),
            bucket: Governor::direct(quota),
            window: Mutex::new(VecDeque::with_capacity(rate.get() as usize)),
            per_second: rate.get() as usize,
        }
    }

    /// Waits until one more request fits the budget
    pub async fn acquire(&self) -> Result<Permit, CorpusError> {
        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CorpusError::RateLimitExhausted)?;

        self.bucket.until_ready().await;

        loop {
            match self.reserve_window_slot() {
                Ok(issued_at) => {
                    return Ok(Permit {
                        _permit: permit,
                        issued_at,
                    })
                }
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Takes a permit only if one is available right now
    ///
    /// # Returns
    ///
    /// * `Ok(Permit)` - The request may be issued
    /// * `Err(CorpusError::RateLimitExhausted)` - The budget is spent for now
    pub fn try_acquire(&self) -> Result<Permit, CorpusError> {
        let permit = self
            .in_flight
            .clone()
            .try_acquire_owned()
            .map_err(|_| CorpusError::RateLimitExhausted)?;

        // Check the window first so a refusal does not burn a bucket token
        if self.window_is_full() {
            return Err(CorpusError::RateLimitExhausted);
        }
        self.bucket
            .check()
            .map_err(|_| CorpusError::RateLimitExhausted)?;

        let issued_at = self
            .reserve_window_slot()
            .map_err(|_| CorpusError::RateLimitExhausted)?;
        Ok(Permit {
            _permit: permit,
            issued_at,
        })
    }

    /// Returns a permit's in-flight slot
    pub fn release(&self, permit: Permit) {
        drop(permit);
    }

    /// Requests currently in flight
    pub fn in_flight(&self) -> usize {
        self.per_second - self.in_flight.available_permits()
    }

    fn window_is_full(&self) -> bool {
        let now = Instant::now();
        let mut log = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        prune(&mut log, now);
        log.len() >= self.per_second
    }

    /// Records a request at the current instant if the trailing window has room
    ///
    /// Returns how long to wait before retrying otherwise. The log only holds
    /// instants, so a lock poisoned by a panicking holder is still consistent
    /// and is recovered rather than refused.
    fn reserve_window_slot(&self) -> Result<Instant, Duration> {
        let now = Instant::now();
        let mut log = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        prune(&mut log, now);

        if log.len() < self.per_second {
            log.push_back(now);
            return Ok(now);
        }

        let oldest = log.front().copied().unwrap_or(now);
        Err((oldest + WINDOW).saturating_duration_since(now) + Duration::from_millis(1))
    }
}

fn prune(log: &mut VecDeque<Instant>, now: Instant) {
    while let Some(front) = log.front() {
        if now.duration_since(*front) >= WINDOW {
            log.pop_front();
        } else {
            break;
        }
    }
}
