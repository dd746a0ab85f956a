//! Common Test Utilities for Integration Tests
//!
//! Shared helpers used across integration test modules.

#![allow(dead_code)]

use roomload::config::ConnectionConfig;
use roomload::loadtest::{Report, TesterReport};
use roomload::media::{MediaCatalog, TrackKind, VideoQuality};
use roomload::tester::{Tester, TesterParams, TesterRole};
use roomload::{LoadTest, LoadTestError, LoadTestParams, LoopbackOptions, LoopbackTransport, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Parameters with a fixed identity prefix and a fast join rate
pub fn params() -> LoadTestParams {
    LoadTestParams {
        identity_prefix: Some("itest".to_string()),
        num_per_second: 10.0,
        resolutions: vec!["360p".to_string()],
        duration: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn loopback(options: LoopbackOptions) -> Arc<LoopbackTransport> {
    Arc::new(LoopbackTransport::new(options))
}

/// Validate and run a load test against `transport`
pub async fn run_on(
    params: LoadTestParams,
    transport: &Arc<LoopbackTransport>,
    cancel: CancellationToken,
) -> Result<Report, LoadTestError> {
    let test = LoadTest::from_params(params, Arc::clone(transport) as Arc<dyn Transport>)?;
    test.run(cancel).await
}

pub async fn run(params: LoadTestParams, options: LoopbackOptions) -> Result<Report, LoadTestError> {
    run_on(params, &loopback(options), CancellationToken::new()).await
}

/// Every subscriber row in the report
pub fn subscriber_rows(report: &Report) -> Vec<&TesterReport> {
    report
        .rooms
        .iter()
        .flat_map(|r| r.testers.iter())
        .filter(|t| t.name.starts_with("Sub "))
        .collect()
}

pub fn tracks_of_kind(tester: &TesterReport, kind: TrackKind) -> usize {
    tester.tracks.iter().filter(|t| t.kind == kind).count()
}

/// A publisher joined outside of any load test, publishing one video track
pub async fn external_publisher(transport: &Arc<LoopbackTransport>, room: &str) -> Arc<Tester> {
    let tester = Arc::new(Tester::new(
        TesterParams {
            name: format!("External {}", room),
            identity: format!("external_{}", room),
            room: room.to_string(),
            role: TesterRole::Publisher,
            quality: VideoQuality::High,
            resolution: "360p".to_string(),
            same_room: false,
            expected_tracks: 0,
            connection: ConnectionConfig::default(),
        },
        Arc::clone(transport) as Arc<dyn Transport>,
        CancellationToken::new(),
    ));
    tester.start().await.unwrap();
    let catalog = MediaCatalog::new(roomload::media::Codec::H264);
    tester.publish_video(&catalog, "video", "360p").await.unwrap();
    tester
}
