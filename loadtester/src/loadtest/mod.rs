//! Load test orchestration
//!
//! A run goes through fixed phases:
//! 1. publishers are started (throttled) and publish their tracks
//! 2. subscriber cohorts are started (throttled), some also publish data
//! 3. every connect attempt is awaited, then data publishing is released
//! 4. steady state until the duration elapses or the run is canceled
//! 5. teardown, then every tester's ledger folds into the `Report`
//!
//! Tester failures never abort a run; they are recorded per tester and show
//! up in the report.

pub mod report;
mod throttle;

pub use report::{Report, ReportBuilder, RoomReport, RunMetadata, RunPhase, TesterReport, TrackRow};
pub use throttle::{THROTTLE_PAUSE, Throttle};

use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, LoadTestParams, TestConfig};
use crate::media::{MediaCatalog, VideoQuality};
use crate::planner::{PopulationPlan, PublisherMedia, PublisherSlot, SubscriberSlot, plan_population};
use crate::session::Transport;
use crate::speaker::SpeakerSimulator;
use crate::stats::{FailureStage, TesterFailure, TesterStats};
use crate::tester::{ReadySignal, Tester, TesterError, TesterParams, TesterRole};

/// Upper bound on releasing one tester's session during teardown
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LoadTestError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Canceled before steady state; carries whatever was measured so far
    #[error("Load test canceled during {phase}")]
    Canceled { phase: RunPhase, report: Box<Report> },
}

pub struct LoadTest {
    config: TestConfig,
    transport: Arc<dyn Transport>,
    catalog: Arc<MediaCatalog>,
}

impl LoadTest {
    pub fn new(config: TestConfig, transport: Arc<dyn Transport>) -> Self {
        let catalog = Arc::new(MediaCatalog::new(config.codec));
        Self {
            config,
            transport,
            catalog,
        }
    }

    /// Validate raw parameters before anything connects
    pub fn from_params(params: LoadTestParams, transport: Arc<dyn Transport>) -> Result<Self, LoadTestError> {
        Ok(Self::new(TestConfig::from_params(params)?, transport))
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    pub fn plan(&self) -> PopulationPlan {
        plan_population(&self.config)
    }

    /// Run the load test to completion or cancellation.
    ///
    /// Cancellation during steady state ends the run normally, with the
    /// phase noted in the report. Cancellation before that returns
    /// `LoadTestError::Canceled` holding the partial report.
    pub async fn run(&self, cancel: CancellationToken) -> Result<Report, LoadTestError> {
        let config = &self.config;
        let started_at = Utc::now();
        let plan = self.plan();
        self.log_start(&plan);

        let errors: Arc<DashMap<String, TesterFailure>> = Arc::new(DashMap::new());
        let (ready_tx, ready_rx) = watch::channel(false);
        let mut throttle = Throttle::new(config.num_per_second);
        let mut canceled = None;

        // Publishers
        let mut publishers: Vec<(Arc<Tester>, PublisherSlot)> = Vec::with_capacity(plan.publishers.len());
        let mut tasks = JoinSet::new();
        for slot in &plan.publishers {
            if !throttle.admit(&cancel).await {
                canceled = Some(RunPhase::Publishers);
                break;
            }
            let tester = Arc::new(Tester::new(
                self.publisher_params(slot),
                Arc::clone(&self.transport),
                cancel.child_token(),
            ));
            publishers.push((Arc::clone(&tester), slot.clone()));
            tasks.spawn(start_publisher(
                tester,
                slot.media,
                slot.resolution.clone(),
                config.simulcast,
                Arc::clone(&self.catalog),
                Arc::clone(&errors),
            ));
        }
        tasks.join_all().await;
        info!(publishers = publishers.len(), failed = errors.len(), "Publishers started");

        // Rooms whose only publisher failed get no subscribers
        let mut failed_cohorts: HashMap<usize, TesterFailure> = HashMap::new();
        if !config.same_room {
            for (_, slot) in &publishers {
                if let Some(failure) = errors.get(&slot.name) {
                    failed_cohorts.insert(
                        slot.cohort,
                        TesterFailure::new(
                            FailureStage::Skipped,
                            format!("{} failed: {}", slot.name, failure.value()),
                        ),
                    );
                }
            }
        }

        // Subscribers
        let mut subscribers: Vec<Arc<Tester>> = Vec::with_capacity(plan.subscriber_count());
        let mut skipped: Vec<&SubscriberSlot> = Vec::new();
        let mut tasks = JoinSet::new();
        if canceled.is_none() {
            'cohorts: for (index, cohort) in plan.cohorts.iter().enumerate() {
                let mut data_quota = config.data_publishers;
                for slot in &cohort.slots {
                    if let Some(failure) = failed_cohorts.get(&index) {
                        errors.insert(slot.name.clone(), failure.clone());
                        skipped.push(slot);
                        continue;
                    }
                    if !throttle.admit(&cancel).await {
                        canceled = Some(RunPhase::Subscribers);
                        break 'cohorts;
                    }

                    let publish_data = data_quota > 0;
                    if publish_data {
                        data_quota -= 1;
                    }
                    let tester = Arc::new(Tester::new(
                        self.subscriber_params(slot),
                        Arc::clone(&self.transport),
                        cancel.child_token(),
                    ));
                    subscribers.push(Arc::clone(&tester));
                    tasks.spawn(start_subscriber(
                        tester,
                        publish_data.then_some((config.data_packet_bytes, config.data_bitrate_bps)),
                        ready_rx.clone(),
                        Arc::clone(&errors),
                    ));
                }
            }
        }

        let mut simulator = SpeakerSimulator::new(
            publishers.iter().map(|(tester, _)| Arc::clone(tester)).collect(),
            config.speaker_interval,
            config.speaking_duration,
            &cancel,
        );
        if config.simulate_speakers && canceled.is_none() {
            simulator.start();
        }

        tasks.join_all().await;
        if canceled.is_none() && cancel.is_cancelled() {
            canceled = Some(RunPhase::Connecting);
        }
        ready_tx.send_replace(true);
        info!(
            subscribers = subscribers.len(),
            skipped = skipped.len(),
            failed = errors.len(),
            "Finished connecting"
        );

        if canceled.is_none() {
            match config.duration {
                Some(duration) => {
                    info!(?duration, "Running load test");
                    tokio::select! {
                        _ = cancel.cancelled() => canceled = Some(RunPhase::Running),
                        _ = tokio::time::sleep(duration) => {}
                    }
                }
                None => {
                    info!("Running load test until canceled");
                    cancel.cancelled().await;
                    canceled = Some(RunPhase::Running);
                }
            }
        }

        simulator.stop().await;

        // Teardown: flip every tester first so loops stop together, then
        // release sessions concurrently
        let testers: Vec<Arc<Tester>> = publishers
            .iter()
            .map(|(tester, _)| Arc::clone(tester))
            .chain(subscribers.iter().cloned())
            .collect();
        for tester in &testers {
            tester.signal_stop();
        }

        let mut builder = ReportBuilder::new();
        for (tester, slot) in &publishers {
            // Healthy publishers receive nothing and are left out
            if let Some(failure) = errors.get(&slot.name) {
                let mut stats = tester.stats();
                stats.error = Some(failure.clone());
                builder.add_tester(&slot.room, &slot.name, &stats);
            }
        }
        for subscriber in &subscribers {
            let mut stats = subscriber.stats();
            stats.error = errors.get(subscriber.name()).map(|f| f.value().clone());
            builder.add_tester(subscriber.room(), subscriber.name(), &stats);
        }
        for slot in &skipped {
            let stats = TesterStats {
                expected_tracks: slot.expected_tracks,
                tracks: Default::default(),
                error: errors.get(&slot.name).map(|f| f.value().clone()),
            };
            builder.add_tester(&slot.room, &slot.name, &stats);
        }

        let releases = testers.iter().map(|tester| async move {
            if tokio::time::timeout(RELEASE_TIMEOUT, tester.release())
                .await
                .is_err()
            {
                warn!(tester = %tester.name(), "Timed out releasing session");
            }
        });
        futures_util::future::join_all(releases).await;
        debug!(testers = testers.len(), "All testers released");

        let testers_failed = errors
            .iter()
            .filter(|entry| entry.value().stage != FailureStage::Skipped)
            .count();
        let report = builder.build(RunMetadata {
            started_at,
            duration: config.duration,
            canceled_during: canceled,
            testers_started: throttle.started() as usize,
            testers_failed,
            subscribers: config.subscribers,
        });

        match canceled {
            Some(phase) if phase != RunPhase::Running => {
                warn!(%phase, "Load test canceled");
                Err(LoadTestError::Canceled {
                    phase,
                    report: Box::new(report),
                })
            }
            _ => {
                info!(
                    packets = report.total.packets,
                    errors = report.total.err_count,
                    "Load test finished"
                );
                Ok(report)
            }
        }
    }

    fn log_start(&self, plan: &PopulationPlan) {
        let config = &self.config;
        info!(
            room = %config.room,
            video_publishers = config.video_publishers,
            audio_publishers = config.audio_publishers,
            remote_publishers = config.remote_publishers,
            subscribers = plan.subscriber_count(),
            data_publishers = config.data_publishers,
            high = plan.split.high,
            medium = plan.split.medium,
            low = plan.split.low,
            "Starting load test"
        );
    }

    fn publisher_params(&self, slot: &PublisherSlot) -> TesterParams {
        TesterParams {
            name: slot.name.clone(),
            identity: slot.identity.clone(),
            room: slot.room.clone(),
            role: TesterRole::Publisher,
            quality: VideoQuality::High,
            resolution: slot.resolution.clone(),
            same_room: self.config.same_room,
            expected_tracks: 0,
            connection: self.config.connection.clone(),
        }
    }

    fn subscriber_params(&self, slot: &SubscriberSlot) -> TesterParams {
        TesterParams {
            name: slot.name.clone(),
            identity: slot.identity.clone(),
            room: slot.room.clone(),
            role: TesterRole::Subscriber,
            quality: slot.quality,
            resolution: slot.resolution.clone(),
            same_room: self.config.same_room,
            expected_tracks: slot.expected_tracks,
            connection: self.config.connection.clone(),
        }
    }
}

fn record_failure(errors: &DashMap<String, TesterFailure>, name: &str, stage: FailureStage, error: &TesterError) {
    // Canceled testers are torn down with the run, not failures
    if matches!(error, TesterError::Canceled) {
        return;
    }
    warn!(tester = %name, %stage, error = %error, "Tester failed");
    errors.insert(name.to_string(), TesterFailure::new(stage, error));
}

async fn start_publisher(
    tester: Arc<Tester>,
    media: PublisherMedia,
    resolution: String,
    simulcast: bool,
    catalog: Arc<MediaCatalog>,
    errors: Arc<DashMap<String, TesterFailure>>,
) {
    if let Err(e) = tester.start().await {
        record_failure(&errors, tester.name(), FailureStage::Connect, &e);
        return;
    }

    let published = match media {
        PublisherMedia::Video { with_audio } => {
            let video = if simulcast {
                tester.publish_simulcast(&catalog, "video", &resolution).await
            } else {
                tester.publish_video(&catalog, "video", &resolution).await
            };
            match video {
                Ok(_) if with_audio => tester.publish_audio(&catalog, "audio").await.map(|_| ()),
                other => other.map(|_| ()),
            }
        }
        PublisherMedia::AudioOnly => tester.publish_audio(&catalog, "audio").await.map(|_| ()),
    };

    if let Err(e) = published {
        counter!("roomload_publish_failures_total").increment(1);
        record_failure(&errors, tester.name(), FailureStage::Publish, &e);
    }
}

async fn start_subscriber(
    tester: Arc<Tester>,
    data: Option<(usize, u64)>,
    ready: ReadySignal,
    errors: Arc<DashMap<String, TesterFailure>>,
) {
    if let Err(e) = tester.start().await {
        record_failure(&errors, tester.name(), FailureStage::Connect, &e);
        return;
    }

    if let Some((packet_bytes, bitrate_bps)) = data
        && let Err(e) = tester.publish_data(packet_bytes, bitrate_bps, ready).await
    {
        record_failure(&errors, tester.name(), FailureStage::DataPublish, &e);
    }
}
