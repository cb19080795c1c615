/// Frontier status definitions for tracking crawl progress
///
/// A URL moves monotonically through these statuses:
/// discovered → enqueued → in-progress → {done | failed-permanent}.
use std::fmt;

/// Represents the current status of a URL in the frontier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FrontierStatus {
    // ===== Active States =====
    /// URL has been seen but no task exists for it yet
    Discovered,

    /// A task for the URL sits in the dispatch queue
    Enqueued,

    /// A worker has leased the URL's task
    InProgress,

    // ===== Terminal States =====
    /// The page was fetched, parsed and its output persisted
    Done,

    /// The page failed permanently or exhausted its retries
    FailedPermanent,
}

impl FrontierStatus {
    /// Returns true if this is a terminal status (no further processing needed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::FailedPermanent)
    }

    /// Position of the status along the monotonic path; both terminal statuses share a rank
    fn rank(&self) -> u8 {
        match self {
            Self::Discovered => 0,
            Self::Enqueued => 1,
            Self::InProgress => 2,
            Self::Done | Self::FailedPermanent => 3,
        }
    }

    /// Returns true if moving from `self` to `next` keeps the status monotonic
    ///
    /// Re-entering `InProgress` is allowed so a reclaimed task can be leased
    /// again. Terminal statuses never change.
    pub fn can_transition_to(&self, next: FrontierStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == Self::InProgress && next == Self::InProgress {
            return true;
        }
        next.rank() > self.rank()
    }

    /// Converts the status to a database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Enqueued => "enqueued",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    /// Parses a status from a database string representation
    ///
    /// Returns None if the string doesn't match any known status.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(Self::Discovered),
            "enqueued" => Some(Self::Enqueued),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "failed_permanent" => Some(Self::FailedPermanent),
            _ => None,
        }
    }

    /// Returns all possible statuses
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Discovered,
            Self::Enqueued,
            Self::InProgress,
            Self::Done,
            Self::FailedPermanent,
        ]
    }
}

impl fmt::Display for FrontierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
