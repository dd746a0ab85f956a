//! roomload: load generation for real-time media rooms
//!
//! Spins up synthetic participants ("testers") that publish or subscribe to
//! audio, video and data tracks, measures what arrives, and folds the
//! measurements into a per-room report.

pub mod config;
pub mod loadtest;
pub mod media;
pub mod planner;
pub mod session;
pub mod speaker;
pub mod stats;
pub mod tester;

// Re-export commonly used types
pub use config::{ConfigError, ConnectionConfig, LoadTestParams, TestConfig};
pub use loadtest::{LoadTest, LoadTestError, Report, RunPhase};
pub use session::{LoopbackOptions, LoopbackTransport, Transport, transport_for_url};
pub use tester::{Tester, TesterError, TesterState};
