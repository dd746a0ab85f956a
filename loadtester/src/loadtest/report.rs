//! Final report: per-room, per-tester and per-track summaries
//!
//! Built once at the end of a run from tester snapshots. Rendered as text
//! through `Display`, or serialized to JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::media::TrackKind;
use crate::stats::{KindSummaries, Summary, TesterStats, media_tracks};

/// Where a run was when it was canceled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Publishers,
    Subscribers,
    Connecting,
    Running,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Publishers => "publisher ramp-up",
            RunPhase::Subscribers => "subscriber ramp-up",
            RunPhase::Connecting => "connecting",
            RunPhase::Running => "steady state",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub started_at: DateTime<Utc>,
    /// `None` when the run had no fixed duration
    pub duration: Option<Duration>,
    pub canceled_during: Option<RunPhase>,
    pub testers_started: usize,
    pub testers_failed: usize,
    pub subscribers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRow {
    pub track_id: String,
    pub kind: TrackKind,
    pub summary: Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TesterReport {
    pub name: String,
    pub summary: Summary,
    pub kinds: KindSummaries,
    pub tracks: Vec<TrackRow>,
}

impl TesterReport {
    pub fn from_stats(name: &str, stats: &TesterStats) -> Self {
        let tracks = stats
            .tracks
            .values()
            .map(|track| TrackRow {
                track_id: track.track_id.clone(),
                kind: track.kind,
                summary: Summary::from_track(track),
            })
            .collect();
        Self {
            name: name.to_string(),
            summary: Summary::from_tester(stats),
            kinds: Summary::by_kind(stats),
            tracks,
        }
    }

    /// Audio and video tracks received, against the expected count
    pub fn media_tracks(&self) -> usize {
        media_tracks(&self.kinds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomReport {
    pub room: String,
    pub testers: Vec<TesterReport>,
    pub kinds: KindSummaries,
    pub total: Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub metadata: RunMetadata,
    pub rooms: Vec<RoomReport>,
    pub kinds: KindSummaries,
    /// Every kind together. Counters and errors add up; latency is only
    /// meaningful per kind.
    pub total: Summary,
}

impl Report {
    pub fn room(&self, name: &str) -> Option<&RoomReport> {
        self.rooms.iter().find(|r| r.room == name)
    }

    pub fn tester(&self, name: &str) -> Option<&TesterReport> {
        self.rooms
            .iter()
            .flat_map(|r| r.testers.iter())
            .find(|t| t.name == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Collects tester rows, grouped by room in name order. Testers keep the
/// order in which they were added.
#[derive(Debug, Default)]
pub struct ReportBuilder {
    rooms: BTreeMap<String, Vec<TesterReport>>,
}

impl ReportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tester(&mut self, room: &str, name: &str, stats: &TesterStats) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .push(TesterReport::from_stats(name, stats));
    }

    pub fn build(self, metadata: RunMetadata) -> Report {
        let rooms: Vec<RoomReport> = self
            .rooms
            .into_iter()
            .map(|(room, testers)| {
                let mut kinds = KindSummaries::new();
                for tester in &testers {
                    Summary::merge_kinds(&mut kinds, &tester.kinds);
                }
                let total = Summary::total(testers.iter().map(|t| &t.summary));
                RoomReport {
                    room,
                    testers,
                    kinds,
                    total,
                }
            })
            .collect();
        let mut kinds = KindSummaries::new();
        for room in &rooms {
            Summary::merge_kinds(&mut kinds, &room.kinds);
        }
        let total = Summary::total(rooms.iter().map(|r| &r.total));
        Report {
            metadata,
            rooms,
            kinds,
            total,
        }
    }
}

/// `12.5mbps`, `640.0kbps`, `100bps`
pub fn format_bitrate(bits_per_second: f64) -> String {
    if bits_per_second >= 1_000_000.0 {
        format!("{:.1}mbps", bits_per_second / 1_000_000.0)
    } else if bits_per_second >= 1_000.0 {
        format!("{:.1}kbps", bits_per_second / 1_000.0)
    } else {
        format!("{:.0}bps", bits_per_second)
    }
}

fn format_latency(summary: &Summary) -> String {
    match summary.average_latency() {
        Some(latency) => format!("{:.2}ms", latency.as_secs_f64() * 1000.0),
        None => "-".to_string(),
    }
}

fn format_dropped(summary: &Summary) -> String {
    format!("{} ({:.2}%)", summary.dropped, summary.drop_rate() * 100.0)
}

const RULE: &str = "═══════════════════════════════════════════════════════════════";

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = &self.metadata;
        writeln!(f, "{}", RULE)?;
        write!(
            f,
            " Load test started {} ",
            meta.started_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        )?;
        match meta.duration {
            Some(duration) => writeln!(f, "for {:?}", duration)?,
            None => writeln!(f, "until canceled")?,
        }
        writeln!(
            f,
            " Testers started: {}, failed: {}",
            meta.testers_started, meta.testers_failed
        )?;
        if let Some(phase) = meta.canceled_during {
            writeln!(f, " Canceled during {}, partial results", phase)?;
        }
        writeln!(f, "{}", RULE)?;

        if meta.subscribers == 0 {
            writeln!(f)?;
            writeln!(f, " No subscribers, no traffic was measured")?;
        }

        let width = self
            .rooms
            .iter()
            .flat_map(|r| r.testers.iter())
            .flat_map(|t| {
                std::iter::once(t.name.len()).chain(t.tracks.iter().map(|tr| tr.track_id.len()))
            })
            .max()
            .unwrap_or(0)
            .max("Grand total".len());

        for room in &self.rooms {
            writeln!(f)?;
            writeln!(f, " ─── Statistics for room {} ───", room.room)?;
            for tester in &room.testers {
                if tester.tracks.is_empty() {
                    continue;
                }
                writeln!(f)?;
                writeln!(
                    f,
                    "   {:<width$} | {:<5} | {:>8} | {:>12} | {:>10} | {}",
                    tester.name, "Kind", "Pkts", "Bitrate", "Latency", "Dropped"
                )?;
                for track in &tester.tracks {
                    writeln!(
                        f,
                        "   {:<width$} | {:<5} | {:>8} | {:>12} | {:>10} | {}",
                        track.track_id,
                        track.kind.as_str(),
                        track.summary.packets,
                        format_bitrate(track.summary.bitrate()),
                        format_latency(&track.summary),
                        format_dropped(&track.summary)
                    )?;
                }
            }

            writeln!(f)?;
            writeln!(f, " ─── Summary for room {} ───", room.room)?;
            writeln!(f)?;
            writeln!(
                f,
                "   {:<width$} | {:<5} | {:>6} | {:>12} | {:>10} | {:>16} | Error",
                "Tester", "Kind", "Tracks", "Bitrate", "Latency", "Total dropped"
            )?;
            for tester in &room.testers {
                write_tester(f, tester, width)?;
            }
            write_totals(f, "Total", &room.kinds, &room.total, width)?;
        }

        writeln!(f)?;
        writeln!(f, "{}", RULE)?;
        write_totals(f, "Grand total", &self.kinds, &self.total, width)?;
        writeln!(f, "{}", RULE)
    }
}

/// One row per kind the tester received. A tester that received nothing
/// still gets a row, so missing tracks and errors stay visible.
fn write_tester(f: &mut fmt::Formatter<'_>, tester: &TesterReport, width: usize) -> fmt::Result {
    let error = tester.summary.err_string.as_deref().unwrap_or("");
    if tester.kinds.is_empty() {
        return writeln!(
            f,
            "   {:<width$} | {:<5} | {:>6} | {:>12} | {:>10} | {:>16} | {}",
            tester.name,
            "-",
            format!("0/{}", tester.summary.expected_tracks),
            "-",
            "-",
            "-",
            error
        );
    }

    for (index, (kind, s)) in tester.kinds.iter().enumerate() {
        let tracks = if kind.is_media() {
            format!("{}/{}", tester.media_tracks(), tester.summary.expected_tracks)
        } else {
            s.tracks.to_string()
        };
        writeln!(
            f,
            "   {:<width$} | {:<5} | {:>6} | {:>12} | {:>10} | {:>16} | {}",
            if index == 0 { tester.name.as_str() } else { "" },
            kind.as_str(),
            tracks,
            format_bitrate(s.bitrate()),
            format_latency(s),
            format_dropped(s),
            if index == 0 { error } else { "" }
        )?;
    }
    Ok(())
}

fn write_totals(
    f: &mut fmt::Formatter<'_>,
    label: &str,
    kinds: &KindSummaries,
    total: &Summary,
    width: usize,
) -> fmt::Result {
    for (kind, s) in kinds {
        writeln!(
            f,
            "   {:<width$} | {:<5} | {:>6} | {:>12} | {:>10} | {:>16} | {} avg/track",
            label,
            kind.as_str(),
            s.tracks,
            format_bitrate(s.bitrate()),
            format_latency(s),
            format_dropped(s),
            format_bitrate(s.bitrate_per_track())
        )?;
    }
    writeln!(
        f,
        "   {:<width$} | {:<5} | {:>6} | {:>12} | {:>10} | {:>16} | {} errors",
        label,
        "all",
        format!("{}/{}", media_tracks(kinds), total.expected_tracks),
        format_bitrate(total.bitrate()),
        "-",
        format_dropped(total),
        total.err_count
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{FailureStage, TesterFailure, TrackSnapshot};

    fn track(id: &str, kind: TrackKind, packets: u64, bytes: u64, secs: u64) -> TrackSnapshot {
        TrackSnapshot {
            track_id: id.to_string(),
            kind,
            packets,
            bytes,
            dropped: 0,
            latency: packets * 2_000_000,
            latency_count: packets,
            elapsed: Duration::from_secs(secs),
        }
    }

    fn stats(tracks: Vec<TrackSnapshot>, error: Option<TesterFailure>) -> TesterStats {
        TesterStats {
            expected_tracks: 1,
            tracks: tracks.into_iter().map(|t| (t.track_id.clone(), t)).collect(),
            error,
        }
    }

    fn metadata(subscribers: usize) -> RunMetadata {
        RunMetadata {
            started_at: Utc::now(),
            duration: Some(Duration::from_secs(30)),
            canceled_during: None,
            testers_started: 3,
            testers_failed: 1,
            subscribers,
        }
    }

    fn sample_report() -> Report {
        let mut builder = ReportBuilder::new();
        builder.add_tester(
            "room_2",
            "Sub 0 in room_2",
            &stats(vec![track("TR_b", TrackKind::Video, 5, 500, 4)], None),
        );
        builder.add_tester(
            "room_1",
            "Sub 0 in room_1",
            &stats(vec![track("TR_a", TrackKind::Video, 10, 1000, 2)], None),
        );
        builder.add_tester(
            "room_1",
            "Pub 1",
            &stats(
                Vec::new(),
                Some(TesterFailure::new(FailureStage::Connect, "refused")),
            ),
        );
        builder.build(metadata(2))
    }

    #[test]
    fn test_groups_by_room_and_totals() {
        let report = sample_report();

        let rooms: Vec<_> = report.rooms.iter().map(|r| r.room.as_str()).collect();
        assert_eq!(rooms, vec!["room_1", "room_2"]);

        let room_1 = report.room("room_1").unwrap();
        assert_eq!(room_1.testers.len(), 2);
        assert_eq!(room_1.total.packets, 10);
        assert_eq!(room_1.total.err_count, 1);

        assert_eq!(report.total.packets, 15);
        assert_eq!(report.total.bytes, 1500);
        assert_eq!(report.total.err_count, 1);
        assert_eq!(report.total.elapsed, Duration::from_secs(4));

        let publisher = report.tester("Pub 1").unwrap();
        assert_eq!(publisher.summary.err_string.as_deref(), Some("connect: refused"));
        assert!(publisher.tracks.is_empty());
    }

    #[test]
    fn test_text_rendering() {
        let text = sample_report().to_string();

        assert!(text.contains("Statistics for room room_1"));
        assert!(text.contains("Summary for room room_2"));
        assert!(text.contains("TR_a"));
        assert!(text.contains("connect: refused"));
        assert!(text.contains("Grand total"));
        assert!(!text.contains("No subscribers"));
        // 1000 bytes over 2s
        assert!(text.contains("4.0kbps"));
    }

    #[test]
    fn test_kinds_reported_separately() {
        let data = TrackSnapshot {
            latency: 4 * 50_000_000,
            ..track("DC_x", TrackKind::Data, 4, 400, 2)
        };
        let mut builder = ReportBuilder::new();
        builder.add_tester(
            "room_1",
            "Sub 0 in room_1",
            &stats(vec![track("TR_a", TrackKind::Video, 10, 1000, 2), data], None),
        );
        builder.add_tester(
            "room_1",
            "Sub 1 in room_1",
            &stats(vec![track("TR_a", TrackKind::Video, 6, 600, 2)], None),
        );
        let report = builder.build(metadata(2));

        let tester = report.tester("Sub 0 in room_1").unwrap();
        assert_eq!(tester.media_tracks(), 1);
        assert_eq!(tester.summary.tracks, 2);

        let room = report.room("room_1").unwrap();
        assert_eq!(room.kinds[&TrackKind::Video].tracks, 2);
        assert_eq!(room.kinds[&TrackKind::Video].packets, 16);
        assert_eq!(room.kinds[&TrackKind::Video].average_latency(), Some(Duration::from_millis(2)));
        assert_eq!(room.kinds[&TrackKind::Data].average_latency(), Some(Duration::from_millis(50)));
        assert_eq!(report.kinds, room.kinds);

        let text = report.to_string();
        // Media tracks against expected, the data track on its own row
        assert!(text.contains("   1/1 |"), "{}", text);
        assert!(text.contains("| data  |      1 |"), "{}", text);
        assert!(!text.contains("2/1"), "{}", text);
        // 1600 bytes over 2s across two video tracks
        assert!(text.contains("3.2kbps avg/track"), "{}", text);
        assert!(text.contains("50.00ms"), "{}", text);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["kinds"]["data"]["packets"], 4);
        assert_eq!(json["rooms"][0]["testers"][0]["kinds"]["video"]["bytes"], 1000);
    }

    #[test]
    fn test_no_subscribers_and_cancel_notes() {
        let mut metadata = metadata(0);
        metadata.canceled_during = Some(RunPhase::Subscribers);
        let text = ReportBuilder::new().build(metadata).to_string();

        assert!(text.contains("No subscribers"));
        assert!(text.contains("Canceled during subscriber ramp-up"));
    }

    #[test]
    fn test_json_output() {
        let report = sample_report();
        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["total"]["packets"], 15);
        assert_eq!(value["rooms"][0]["room"], "room_1");
        assert_eq!(value["rooms"][0]["testers"][0]["tracks"][0]["kind"], "video");

        let parsed: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.total, report.total);
    }

    #[test]
    fn test_format_bitrate() {
        assert_eq!(format_bitrate(12_500_000.0), "12.5mbps");
        assert_eq!(format_bitrate(640_000.0), "640.0kbps");
        assert_eq!(format_bitrate(100.0), "100bps");
    }
}
