//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `FrontierStatus`: Tracks the status of individual URLs (discovered, enqueued, in-progress, done, failed)
//! - `PageKind`: The kind of archive page a URL points at
//! - `PageTask`: The unit of work leased by workers from the dispatch queue

mod frontier_status;
mod task;

pub use frontier_status::FrontierStatus;
pub use task::{PageKind, PageTask};
