//! Relay - scheduled reposting of media posts from a rotating pool of sources
//!
//! Each run picks one source by time of day, fetches its recent media posts,
//! selects one that was never relayed, republishes it to the operator account
//! and records it so it is never repeated.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod rate_limit;
pub mod remote;
pub mod rotation;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use error::{RelayError, Result};
pub use pipeline::{RelayPipeline, RunOutcome, RunReport, RunStats};
pub use rate_limit::{RateLimitPolicy, RateLimitedCaller, RetryPolicy};
pub use state::{CursorMap, HistorySet, StateStore};
pub use types::{CandidatePost, MediaItem, PostId, PublishSurface};
