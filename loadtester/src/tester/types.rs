//! Tester-related types and error definitions

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::config::ConnectionConfig;
use crate::media::{MediaError, VideoQuality};
use crate::session::SessionError;

/// Errors from one tester's lifecycle operations
#[derive(Debug, Error)]
pub enum TesterError {
    #[error("Could not connect after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: SessionError,
    },

    #[error("Could not publish {track}: {source}")]
    Publish {
        track: String,
        #[source]
        source: SessionError,
    },

    #[error("Tester was canceled")]
    Canceled,

    #[error("Tester is not running")]
    NotRunning,

    #[error("Tester is already stopped")]
    AlreadyStopped,

    #[error("Packet size too small for bitrate: one packet every {interval:?}, at most 1000 packets per second")]
    DataRateTooHigh { interval: Duration },

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Lifecycle of a tester. `Stopped` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TesterState {
    Idle = 0,
    Connecting = 1,
    Running = 2,
    Stopped = 3,
    Failed = 4,
}

impl TesterState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TesterState::Idle,
            1 => TesterState::Connecting,
            2 => TesterState::Running,
            3 => TesterState::Stopped,
            _ => TesterState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TesterState::Stopped | TesterState::Failed)
    }
}

impl fmt::Display for TesterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TesterState::Idle => "idle",
            TesterState::Connecting => "connecting",
            TesterState::Running => "running",
            TesterState::Stopped => "stopped",
            TesterState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// `TesterState` stored in an atomic so loops can observe changes without locking
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(state: TesterState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> TesterState {
        TesterState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; false if the state was something else
    pub fn transition(&self, from: TesterState, to: TesterState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TesterRole {
    Publisher,
    Subscriber,
}

/// Identity and placement of one tester
#[derive(Debug, Clone)]
pub struct TesterParams {
    /// Report key, e.g. `Pub 3` or `Sub 0 in load-test_3`
    pub name: String,
    pub identity: String,
    pub room: String,
    pub role: TesterRole,
    pub quality: VideoQuality,
    /// Resolution of the room's publisher, used to steer the received layer
    pub resolution: String,
    pub same_room: bool,
    pub expected_tracks: usize,
    pub connection: ConnectionConfig,
}
