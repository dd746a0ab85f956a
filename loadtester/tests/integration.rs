//! Integration Tests for roomload
//!
//! These tests drive complete load test runs against the loopback room
//! service, checking the report as a whole rather than individual units.

use roomload::config::ConfigError;
use roomload::loadtest::RunPhase;
use roomload::media::TrackKind;
use roomload::stats::FailureStage;
use roomload::{LoadTestError, LoadTestParams, LoopbackOptions};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod common;
use common::*;

// ============================================================================
// Full Runs
// ============================================================================

mod full_runs {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_per_room_run_reports_every_subscriber() {
        let report = run(
            LoadTestParams {
                video_publishers: 2,
                subscribers: 3,
                high: 1,
                medium: 1,
                low: 1,
                with_audio: true,
                ..params()
            },
            LoopbackOptions::default(),
        )
        .await
        .unwrap();

        let rooms: Vec<_> = report.rooms.iter().map(|r| r.room.as_str()).collect();
        assert_eq!(rooms, vec!["load-test_1", "load-test_2"]);

        for room in &report.rooms {
            assert_eq!(room.testers.len(), 3);
            for tester in &room.testers {
                assert_eq!(tester.summary.expected_tracks, 2);
                assert_eq!(tracks_of_kind(tester, TrackKind::Video), 1);
                assert_eq!(tracks_of_kind(tester, TrackKind::Audio), 1);
                assert!(tester.summary.packets > 0, "{} received nothing", tester.name);
                assert_eq!(tester.summary.err_count, 0);
            }
        }
        assert_eq!(report.metadata.testers_started, 8);
        assert_eq!(report.metadata.testers_failed, 0);
        assert_eq!(report.total.tracks, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_canceled_in_steady_state() {
        let transport = loopback(LoopbackOptions::default());
        let cancel = CancellationToken::new();
        let canceler = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceler.cancel();
        });

        let report = run_on(
            LoadTestParams {
                video_publishers: 1,
                subscribers: 1,
                duration: Duration::ZERO,
                ..params()
            },
            &transport,
            cancel,
        )
        .await
        .unwrap();

        assert_eq!(report.metadata.duration, None);
        assert_eq!(report.metadata.canceled_during, Some(RunPhase::Running));
        assert!(report.total.packets > 0);
        assert_eq!(transport.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_subscribers_still_reports() {
        let report = run(
            LoadTestParams {
                video_publishers: 2,
                subscribers: 0,
                ..params()
            },
            LoopbackOptions::default(),
        )
        .await
        .unwrap();

        // Healthy publishers have nothing to report
        assert!(report.rooms.is_empty());
        assert_eq!(report.metadata.subscribers, 0);
        assert_eq!(report.metadata.testers_started, 2);
        assert!(report.to_string().contains("No subscribers"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_publishers() {
        let transport = loopback(LoopbackOptions::default());
        let external = external_publisher(&transport, "load-test_3").await;

        let report = run_on(
            LoadTestParams {
                remote_publishers: 1,
                start_remote_room_number: 3,
                subscribers: 2,
                ..params()
            },
            &transport,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let room = report.room("load-test_3").unwrap();
        assert_eq!(room.testers.len(), 2);
        for tester in &room.testers {
            assert_eq!(tester.summary.expected_tracks, 1);
            assert_eq!(tester.summary.tracks, 1);
            assert!(tester.summary.packets > 0);
        }

        external.stop().await;
    }
}

// ============================================================================
// Failures
// ============================================================================

mod failures {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_same_room_with_no_publisher_started() {
        let report = run(
            LoadTestParams {
                video_publishers: 2,
                subscribers: 2,
                same_room: true,
                ..params()
            },
            LoopbackOptions {
                refused_identities: vec!["_pub".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let room = report.room("load-test").unwrap();
        assert_eq!(room.testers.len(), 4);

        for name in ["Pub 1", "Pub 2"] {
            let publisher = report.tester(name).unwrap();
            let error = publisher.summary.err_string.as_deref().unwrap();
            assert!(error.starts_with("connect: Could not connect after 10 attempts"), "{}", error);
        }

        // Subscribers still joined, and saw nothing
        let subscribers = subscriber_rows(&report);
        assert_eq!(subscribers.len(), 2);
        for subscriber in subscribers {
            assert_eq!(subscriber.summary.err_count, 0);
            assert_eq!(subscriber.summary.tracks, 0);
            assert_eq!(subscriber.summary.expected_tracks, 2);
        }

        assert_eq!(report.metadata.testers_failed, 2);
        assert_eq!(report.total.err_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_room_failure_skips_only_that_room() {
        let report = run(
            LoadTestParams {
                video_publishers: 3,
                subscribers: 2,
                ..params()
            },
            LoopbackOptions {
                refused_identities: vec!["_pubload-test_2_".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let broken = report.room("load-test_2").unwrap();
        // The failed publisher plus its two skipped subscribers
        assert_eq!(broken.testers.len(), 3);
        assert_eq!(broken.total.err_count, 3);
        for j in 0..2 {
            let skipped = report.tester(&format!("Sub {} in load-test_2", j)).unwrap();
            let error = skipped.summary.err_string.as_deref().unwrap();
            assert!(error.starts_with(&format!("{}: Pub 2 failed", FailureStage::Skipped)), "{}", error);
        }

        for room in ["load-test_1", "load-test_3"] {
            let healthy = report.room(room).unwrap();
            assert_eq!(healthy.total.err_count, 0);
            assert!(healthy.total.packets > 0);
        }
        // Skipped subscribers never started
        assert_eq!(report.metadata.testers_started, 7);
        assert_eq!(report.metadata.testers_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_connect_failures_are_retried() {
        let report = run(
            LoadTestParams {
                video_publishers: 1,
                subscribers: 1,
                ..params()
            },
            LoopbackOptions {
                connect_failures: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(report.total.err_count, 0);
        assert!(report.total.packets > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_ramp_up() {
        let cancel = CancellationToken::new();
        let canceler = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceler.cancel();
        });

        let result = run_on(
            LoadTestParams {
                video_publishers: 20,
                subscribers: 1,
                num_per_second: 2.0,
                ..params()
            },
            &loopback(LoopbackOptions::default()),
            cancel,
        )
        .await;

        match result {
            Err(LoadTestError::Canceled { phase, report }) => {
                assert_eq!(phase, RunPhase::Publishers);
                assert!(report.metadata.testers_started < 20);
                assert!(report.to_string().contains("Canceled during publisher ramp-up"));
            }
            other => panic!("expected cancellation, got {:?}", other.map(|r| r.metadata)),
        }
    }

    #[tokio::test]
    async fn test_tiny_data_packets_are_rejected() {
        let result = run(
            LoadTestParams {
                video_publishers: 2,
                subscribers: 3,
                high: 1,
                medium: 1,
                low: 1,
                data_packet_bytes: 1,
                data_bitrate_kbps: 1,
                ..params()
            },
            LoopbackOptions::default(),
        )
        .await;

        assert!(matches!(
            result,
            Err(LoadTestError::Config(ConfigError::DataPacketTooSmall { bytes: 1 }))
        ));
    }
}

// ============================================================================
// Data Path
// ============================================================================

mod data_path {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_data_publishers_reach_other_subscribers() {
        let report = run(
            LoadTestParams {
                video_publishers: 1,
                subscribers: 3,
                data_publishers: 2,
                data_packet_bytes: 100,
                data_bitrate_kbps: 8,
                ..params()
            },
            LoopbackOptions::default(),
        )
        .await
        .unwrap();

        let subscribers = subscriber_rows(&report);
        let data_tracks: usize = subscribers
            .iter()
            .map(|s| tracks_of_kind(s, TrackKind::Data))
            .sum();
        // Two senders, each heard by the two other subscribers
        assert_eq!(data_tracks, 4);

        // Data tracks are reported beside media, not counted against it
        let room = report.room("load-test_1").unwrap();
        assert_eq!(room.kinds[&TrackKind::Data].tracks, 4);
        assert_eq!(room.kinds[&TrackKind::Video].tracks, 3);
        for subscriber in &subscribers {
            assert_eq!(subscriber.media_tracks(), subscriber.summary.expected_tracks);
        }

        for subscriber in &subscribers {
            for track in subscriber.tracks.iter().filter(|t| t.kind == TrackKind::Data) {
                assert!(track.summary.packets > 0);
                assert_eq!(track.summary.bytes, track.summary.packets * 100);
            }
        }
    }
}

// ============================================================================
// Long Scenarios
// ============================================================================

mod scenarios {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "runs for 30 seconds of wall time; run with --ignored"]
    async fn test_lossy_fanout_scenario() {
        let report = run(
            LoadTestParams {
                video_publishers: 5,
                subscribers: 10,
                high: 4,
                medium: 3,
                low: 3,
                with_audio: true,
                data_publishers: 2,
                simulate_speakers: true,
                resolutions: vec!["720p".to_string()],
                duration: Duration::from_secs(30),
                ..params()
            },
            LoopbackOptions {
                packet_loss: 0.01,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        println!("{}", report);
        assert_eq!(report.total.err_count, 0);
        assert!(report.total.dropped > 0);
        assert!(report.total.drop_rate() < 0.1);
        assert!(report.kinds[&TrackKind::Video].average_latency().is_some());
        assert!(report.kinds[&TrackKind::Data].average_latency().is_some());
    }
}
