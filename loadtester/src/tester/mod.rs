//! Synthetic participants
//!
//! - `Tester` drives one session through connect, publish and stop
//! - `consumer` handles the session's events and reads subscribed tracks

mod consumer;
mod lifecycle;
mod types;

pub use lifecycle::{CONNECT_ATTEMPTS, CONNECT_BACKOFF, ReadySignal, Tester};
pub use types::{AtomicState, TesterError, TesterParams, TesterRole, TesterState};
