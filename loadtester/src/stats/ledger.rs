//! Per-tester traffic ledger
//!
//! One `Ledger` per tester, keyed by remote track id. Entries are created on
//! subscription (or on the first write) and only ever incremented until
//! `reset`. The hot path takes a shard read lock on the map and then does
//! plain atomic adds.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use super::latency::now_nanos;
use super::summary::TesterFailure;
use crate::media::TrackKind;

/// Counters for one observed track
#[derive(Debug)]
pub struct TrackStats {
    track_id: String,
    kind: TrackKind,
    /// Wall clock (ns) when the track was first seen; 0 until then
    started_at: AtomicI64,
    packets: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
    /// Sum of valid latency samples in ns
    latency: AtomicU64,
    latency_count: AtomicU64,
}

impl TrackStats {
    fn new(track_id: &str, kind: TrackKind) -> Self {
        Self {
            track_id: track_id.to_string(),
            kind,
            started_at: AtomicI64::new(0),
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            latency: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
        }
    }

    fn mark_started(&self, now: i64) {
        let _ = self
            .started_at
            .compare_exchange(0, now, Ordering::Relaxed, Ordering::Relaxed);
    }

    fn apply(&self, observation: Observation) {
        match observation {
            Observation::Packet { bytes, latency } => {
                self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                self.packets.fetch_add(1, Ordering::Relaxed);
                if let Some(latency) = latency {
                    self.latency.fetch_add(latency, Ordering::Relaxed);
                    self.latency_count.fetch_add(1, Ordering::Relaxed);
                }
            }
            Observation::Dropped(count) => {
                self.dropped.fetch_add(count, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self, now: i64) -> TrackSnapshot {
        let started_at = self.started_at.load(Ordering::Relaxed);
        let elapsed = if started_at > 0 && now > started_at {
            Duration::from_nanos((now - started_at) as u64)
        } else {
            Duration::ZERO
        };

        TrackSnapshot {
            track_id: self.track_id.clone(),
            kind: self.kind,
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            latency: self.latency.load(Ordering::Relaxed),
            latency_count: self.latency_count.load(Ordering::Relaxed),
            elapsed,
        }
    }
}

/// A single write into the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// One reassembled packet, with its latency sample when one was valid
    Packet { bytes: usize, latency: Option<u64> },
    /// Packets the depacketizer gave up on
    Dropped(u64),
}

/// Point-in-time copy of one track's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSnapshot {
    pub track_id: String,
    pub kind: TrackKind,
    pub packets: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub latency: u64,
    pub latency_count: u64,
    pub elapsed: Duration,
}

/// One tester's aggregated state, produced on demand
#[derive(Debug, Clone, Default)]
pub struct TesterStats {
    pub expected_tracks: usize,
    pub tracks: BTreeMap<String, TrackSnapshot>,
    pub error: Option<TesterFailure>,
}

/// Thread-safe set of per-track counters owned by one tester
#[derive(Debug, Default)]
pub struct Ledger {
    tracks: DashMap<String, Arc<TrackStats>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for a track (if missing) and start its clock
    pub fn register(&self, track_id: &str, kind: TrackKind) {
        let now = now_nanos();
        let entry = self
            .tracks
            .entry(track_id.to_string())
            .or_insert_with(|| Arc::new(TrackStats::new(track_id, kind)));
        entry.mark_started(now);
    }

    /// Add an observation to a track, creating the entry on first write.
    ///
    /// The kind is fixed when the entry is created; later writes with a
    /// different kind do not change it.
    pub fn record(&self, track_id: &str, kind: TrackKind, observation: Observation) {
        if let Some(stats) = self.tracks.get(track_id) {
            stats.apply(observation);
            return;
        }

        self.register(track_id, kind);
        if let Some(stats) = self.tracks.get(track_id) {
            stats.apply(observation);
        }
    }

    /// Read every counter. Reads across different tracks may be torn.
    pub fn snapshot(&self, expected_tracks: usize) -> TesterStats {
        let now = now_nanos();
        let tracks = self
            .tracks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot(now)))
            .collect();

        TesterStats {
            expected_tracks,
            tracks,
            error: None,
        }
    }

    /// Replace every entry with a zeroed one keeping the track id and kind
    pub fn reset(&self) {
        for mut entry in self.tracks.iter_mut() {
            let fresh = TrackStats::new(&entry.track_id, entry.kind);
            fresh.mark_started(now_nanos());
            *entry.value_mut() = Arc::new(fresh);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(bytes: usize) -> Observation {
        Observation::Packet {
            bytes,
            latency: None,
        }
    }

    #[test]
    fn test_record_creates_entry_with_fixed_kind() {
        let ledger = Ledger::new();
        ledger.record("TR_a", TrackKind::Video, packet(100));
        ledger.record("TR_a", TrackKind::Audio, packet(50));

        let stats = ledger.snapshot(1);
        let track = &stats.tracks["TR_a"];
        assert_eq!(track.kind, TrackKind::Video);
        assert_eq!(track.packets, 2);
        assert_eq!(track.bytes, 150);
        assert_eq!(stats.expected_tracks, 1);
    }

    #[test]
    fn test_latency_sum_and_count() {
        let ledger = Ledger::new();
        ledger.record(
            "TR_a",
            TrackKind::Video,
            Observation::Packet {
                bytes: 10,
                latency: Some(2_000),
            },
        );
        ledger.record(
            "TR_a",
            TrackKind::Video,
            Observation::Packet {
                bytes: 10,
                latency: Some(4_000),
            },
        );
        ledger.record("TR_a", TrackKind::Video, packet(10));
        ledger.record("TR_a", TrackKind::Video, Observation::Dropped(3));

        let track = &ledger.snapshot(1).tracks["TR_a"];
        assert_eq!(track.packets, 3);
        assert_eq!(track.latency, 6_000);
        assert_eq!(track.latency_count, 2);
        assert_eq!(track.dropped, 3);
    }

    #[test]
    fn test_register_shows_silent_tracks() {
        let ledger = Ledger::new();
        ledger.register("TR_silent", TrackKind::Audio);

        let stats = ledger.snapshot(2);
        assert_eq!(stats.tracks.len(), 1);
        assert_eq!(stats.tracks["TR_silent"].packets, 0);
    }

    #[test]
    fn test_reset_keeps_identity() {
        let ledger = Ledger::new();
        ledger.record("TR_v", TrackKind::Video, packet(1200));
        ledger.record("PA_d", TrackKind::Data, packet(64));

        ledger.reset();

        let stats = ledger.snapshot(2);
        assert_eq!(stats.tracks.len(), 2);
        assert_eq!(stats.tracks["TR_v"].kind, TrackKind::Video);
        assert_eq!(stats.tracks["TR_v"].bytes, 0);
        assert_eq!(stats.tracks["PA_d"].kind, TrackKind::Data);
        assert_eq!(stats.tracks["PA_d"].packets, 0);

        // Writes after reset land in the fresh entry
        ledger.record("TR_v", TrackKind::Video, packet(10));
        assert_eq!(ledger.snapshot(2).tracks["TR_v"].bytes, 10);
    }

    #[test]
    fn test_concurrent_writers_on_distinct_tracks() {
        let ledger = Arc::new(Ledger::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    let id = format!("TR_{}", i);
                    for _ in 0..1000 {
                        ledger.record(&id, TrackKind::Video, packet(10));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = ledger.snapshot(4);
        assert_eq!(stats.tracks.len(), 4);
        for track in stats.tracks.values() {
            assert_eq!(track.packets, 1000);
            assert_eq!(track.bytes, 10_000);
        }
    }
}
