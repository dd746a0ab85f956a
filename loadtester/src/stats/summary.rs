//! Reductions from ledger snapshots to summary values

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::ledger::{TesterStats, TrackSnapshot};
use crate::media::TrackKind;

/// Summaries kept apart per track kind, so data channel traffic never blends
/// into media latency or per-track bitrate
pub type KindSummaries = BTreeMap<TrackKind, Summary>;

/// Where in a tester's lifecycle a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Connect,
    Publish,
    DataPublish,
    /// The tester was never started because its room had no working publisher
    Skipped,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureStage::Connect => "connect",
            FailureStage::Publish => "publish",
            FailureStage::DataPublish => "data publish",
            FailureStage::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Structured per-tester error record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TesterFailure {
    pub stage: FailureStage,
    pub message: String,
}

impl TesterFailure {
    pub fn new(stage: FailureStage, error: impl fmt::Display) -> Self {
        Self {
            stage,
            message: error.to_string(),
        }
    }
}

impl fmt::Display for TesterFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.message)
    }
}

/// Totals over one or more tracks or testers. A value, never shared state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub packets: u64,
    pub bytes: u64,
    pub dropped: u64,
    /// Sum of latency samples in ns
    pub latency: u64,
    pub latency_count: u64,
    /// Longest observation window among the reduced tracks
    pub elapsed: Duration,
    pub tracks: usize,
    pub expected_tracks: usize,
    pub err_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err_string: Option<String>,
}

impl Summary {
    pub fn from_track(track: &TrackSnapshot) -> Self {
        Self {
            packets: track.packets,
            bytes: track.bytes,
            dropped: track.dropped,
            latency: track.latency,
            latency_count: track.latency_count,
            elapsed: track.elapsed,
            tracks: 1,
            ..Default::default()
        }
    }

    /// Reduce one tester's tracks. A recorded failure adds one error but does
    /// not discard the tracks that were observed before it.
    pub fn from_tester(stats: &TesterStats) -> Self {
        let per_track: Vec<Summary> = stats.tracks.values().map(Self::from_track).collect();
        let mut summary = Self::total(&per_track);
        summary.expected_tracks = stats.expected_tracks;
        if let Some(ref failure) = stats.error {
            summary.err_count = 1;
            summary.err_string = Some(failure.to_string());
        }
        summary
    }

    /// Reduce one tester's tracks per kind. Expected counts and errors belong
    /// to the tester as a whole and stay out of these.
    pub fn by_kind(stats: &TesterStats) -> KindSummaries {
        let mut kinds = KindSummaries::new();
        for track in stats.tracks.values() {
            kinds.entry(track.kind).or_default().merge(&Self::from_track(track));
        }
        kinds
    }

    /// Fold every per-kind summary of `from` into `into`
    pub fn merge_kinds(into: &mut KindSummaries, from: &KindSummaries) {
        for (kind, summary) in from {
            into.entry(*kind).or_default().merge(summary);
        }
    }

    /// Fold `other` into `self`: counters add up, elapsed takes the max
    pub fn merge(&mut self, other: &Summary) {
        self.packets += other.packets;
        self.bytes += other.bytes;
        self.dropped += other.dropped;
        self.latency += other.latency;
        self.latency_count += other.latency_count;
        self.elapsed = self.elapsed.max(other.elapsed);
        self.tracks += other.tracks;
        self.expected_tracks += other.expected_tracks;
        self.err_count += other.err_count;
    }

    pub fn total<'a>(summaries: impl IntoIterator<Item = &'a Summary>) -> Self {
        let mut total = Self::default();
        for summary in summaries {
            total.merge(summary);
        }
        total
    }

    pub fn average_latency(&self) -> Option<Duration> {
        if self.latency_count == 0 {
            return None;
        }
        Some(Duration::from_nanos(self.latency / self.latency_count))
    }

    /// Fraction of packets lost, relative to everything that was expected
    pub fn drop_rate(&self) -> f64 {
        let expected = self.packets + self.dropped;
        if expected == 0 {
            return 0.0;
        }
        self.dropped as f64 / expected as f64
    }

    /// Received bits per second over the observation window
    pub fn bitrate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 * 8.0 / secs
    }

    pub fn bitrate_per_track(&self) -> f64 {
        if self.tracks == 0 {
            return 0.0;
        }
        self.bitrate() / self.tracks as f64
    }
}

/// Audio and video tracks, the ones expected track counts refer to
pub fn media_tracks(kinds: &KindSummaries) -> usize {
    kinds
        .iter()
        .filter(|(kind, _)| kind.is_media())
        .map(|(_, summary)| summary.tracks)
        .sum()
}
