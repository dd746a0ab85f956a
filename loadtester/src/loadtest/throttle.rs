//! Ramp-up throttle

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Pause between rate checks while over the cap
pub const THROTTLE_PAUSE: Duration = Duration::from_secs(1);

/// Caps the average join rate since the first admission.
///
/// The observed rate is `started / seconds since the throttle was created`.
/// While it is above the cap the caller waits in [`THROTTLE_PAUSE`] steps.
#[derive(Debug)]
pub struct Throttle {
    cap: f64,
    started: u64,
    since: Instant,
}

impl Throttle {
    pub fn new(cap: f64) -> Self {
        Self {
            cap,
            started: 0,
            since: Instant::now(),
        }
    }

    pub fn started(&self) -> u64 {
        self.started
    }

    /// Spawns per second so far; infinite right after the first spawn
    pub fn observed_rate(&self) -> f64 {
        if self.started == 0 {
            return 0.0;
        }
        let elapsed = self.since.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return f64::INFINITY;
        }
        self.started as f64 / elapsed
    }

    /// Wait until one more spawn fits under the cap and count it. Returns
    /// false, without counting, when `cancel` fires first.
    pub async fn admit(&mut self, cancel: &CancellationToken) -> bool {
        while self.observed_rate() > self.cap {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(THROTTLE_PAUSE) => {}
            }
        }
        if cancel.is_cancelled() {
            return false;
        }
        self.started += 1;
        true
    }
}
