//! Traffic statistics: per-track atomic counters and their reductions
//!
//! - `Ledger` holds one tester's per-track counters
//! - `latency` encodes and validates the send-timestamp trailer
//! - `Summary` folds snapshots into per-tester, per-room and grand totals

pub mod latency;
mod ledger;
mod summary;

pub use ledger::{Ledger, Observation, TesterStats, TrackSnapshot};
pub use summary::{FailureStage, KindSummaries, Summary, TesterFailure, media_tracks};
