//! One synthetic participant
//!
//! A `Tester` owns exactly one session. It connects with a bounded retry
//! budget, publishes or subscribes while `Running`, and releases the session
//! exactly once when stopped.

use bytes::Bytes;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::consumer::EventLoop;
use super::types::{AtomicState, TesterError, TesterParams, TesterRole, TesterState};
use crate::config::{MIN_DATA_INTERVAL, data_send_interval};
use crate::media::{Dimensions, MediaCatalog, Resolution, TrackKind};
use crate::session::{ConnectInfo, DataReliability, LocalTrack, Session, TrackHandle, Transport};
use crate::stats::latency::{TRAILER_LEN, stamped_payload};
use crate::stats::{Ledger, TesterStats};

/// Connect attempts before a tester gives up
pub const CONNECT_ATTEMPTS: u32 = 10;

/// Fixed pause between connect attempts
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Recipient that matches nobody, used to prove the data path
const UNREACHABLE_RECIPIENT: &str = "unexist";

/// Released once every tester has finished connecting; data loops wait on it
pub type ReadySignal = watch::Receiver<bool>;

pub struct Tester {
    params: TesterParams,
    transport: Arc<dyn Transport>,
    state: AtomicState,
    session: RwLock<Option<Arc<dyn Session>>>,
    ledger: Arc<Ledger>,
    cancel: CancellationToken,
    data_publishing: Arc<AtomicBool>,
}

impl Tester {
    /// `cancel` is normally a child of the run's token
    pub fn new(params: TesterParams, transport: Arc<dyn Transport>, cancel: CancellationToken) -> Self {
        Self {
            params,
            transport,
            state: AtomicState::new(TesterState::Idle),
            session: RwLock::new(None),
            ledger: Arc::new(Ledger::new()),
            cancel,
            data_publishing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn room(&self) -> &str {
        &self.params.room
    }

    pub fn state(&self) -> TesterState {
        self.state.load()
    }

    pub fn is_running(&self) -> bool {
        self.state.load() == TesterState::Running
    }

    /// Join the room. A no-op when already running.
    pub async fn start(&self) -> Result<(), TesterError> {
        if !self.state.transition(TesterState::Idle, TesterState::Connecting) {
            return match self.state.load() {
                TesterState::Running | TesterState::Connecting => Ok(()),
                _ => Err(TesterError::AlreadyStopped),
            };
        }

        let (session, events) = self.transport.create_session();
        let info = ConnectInfo {
            url: self.params.connection.url.clone(),
            api_key: self.params.connection.api_key.clone(),
            api_secret: self.params.connection.api_secret.clone(),
            room: self.params.room.clone(),
            identity: self.params.identity.clone(),
        };

        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.state.transition(TesterState::Connecting, TesterState::Failed);
                    return Err(TesterError::Canceled);
                }
                result = session.connect(&info) => result,
            };

            match result {
                Ok(()) => break,
                Err(source) if attempt >= CONNECT_ATTEMPTS => {
                    self.state.transition(TesterState::Connecting, TesterState::Failed);
                    counter!("roomload_connect_failures_total").increment(1);
                    return Err(TesterError::Connect {
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    debug!(tester = %self.params.name, attempt, error = %e, "Connect attempt failed, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.state.transition(TesterState::Connecting, TesterState::Failed);
                            return Err(TesterError::Canceled);
                        }
                        _ = tokio::time::sleep(CONNECT_BACKOFF) => {}
                    }
                }
            }
        }
        histogram!("roomload_connect_duration_seconds").record(started.elapsed().as_secs_f64());

        *self.session.write().await = Some(Arc::clone(&session));

        // stop() may have run while we were connecting
        if !self.state.transition(TesterState::Connecting, TesterState::Running) {
            self.release().await;
            return Err(TesterError::Canceled);
        }
        counter!("roomload_testers_started_total").increment(1);
        debug!(tester = %self.params.name, room = %self.params.room, attempts = attempt, "Tester connected");

        let event_loop = EventLoop {
            name: self.params.name.clone(),
            session: Arc::clone(&session),
            ledger: Arc::clone(&self.ledger),
            subscribe: self.params.role == TesterRole::Subscriber,
            steering: self.steering(),
            cancel: self.cancel.child_token(),
        };

        // Tracks published before we joined never produce a TrackPublished event
        if event_loop.subscribe {
            for publication in session.remote_publications().await {
                event_loop.subscribe_to(&publication.sid).await;
            }
        }
        tokio::spawn(event_loop.run(events));

        Ok(())
    }

    /// Dimensions a subscriber asks for; the default layer in a shared room
    fn steering(&self) -> Option<Dimensions> {
        if self.params.same_room {
            return None;
        }
        match Resolution::lookup(&self.params.resolution) {
            Some(resolution) => Some(resolution.dimensions(self.params.quality)),
            None => {
                warn!(tester = %self.params.name, resolution = %self.params.resolution, "Invalid resolution, keeping default layer");
                None
            }
        }
    }

    async fn running_session(&self) -> Result<Arc<dyn Session>, TesterError> {
        if !self.is_running() {
            return Err(TesterError::NotRunning);
        }
        self.session
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(TesterError::NotRunning)
    }

    async fn publish(&self, track: LocalTrack) -> Result<TrackHandle, TesterError> {
        let session = self.running_session().await?;
        let name = track.name.clone();
        let handle = session
            .publish_track(track)
            .await
            .map_err(|source| TesterError::Publish { track: name, source })?;
        debug!(tester = %self.params.name, track = %handle.sid, name = %handle.name, "Published track");
        Ok(handle)
    }

    pub async fn publish_video(
        &self,
        catalog: &MediaCatalog,
        name: &str,
        resolution: &str,
    ) -> Result<TrackHandle, TesterError> {
        let source = catalog.video_source(resolution)?;
        info!(tester = %self.params.name, %resolution, "Publishing video track");
        self.publish(LocalTrack::new(name, TrackKind::Video, vec![source]))
            .await
    }

    /// Publish one video track with a layer per quality tier
    pub async fn publish_simulcast(
        &self,
        catalog: &MediaCatalog,
        name: &str,
        resolution: &str,
    ) -> Result<TrackHandle, TesterError> {
        let sources = catalog.simulcast_sources(resolution)?;
        info!(tester = %self.params.name, %resolution, layers = sources.len(), "Publishing simulcast video track");
        self.publish(LocalTrack::new(name, TrackKind::Video, sources))
            .await
    }

    pub async fn publish_audio(&self, catalog: &MediaCatalog, name: &str) -> Result<TrackHandle, TesterError> {
        info!(tester = %self.params.name, "Publishing audio track");
        self.publish(LocalTrack::new(name, TrackKind::Audio, vec![catalog.audio_source()]))
            .await
    }

    /// Start sending `packet_bytes`-sized data packets at `bitrate_bps` once
    /// `ready` is released. At most one data loop runs per tester.
    pub async fn publish_data(
        &self,
        packet_bytes: usize,
        bitrate_bps: u64,
        mut ready: ReadySignal,
    ) -> Result<(), TesterError> {
        let interval = data_send_interval(packet_bytes, bitrate_bps);
        if interval < MIN_DATA_INTERVAL {
            return Err(TesterError::DataRateTooHigh { interval });
        }

        let session = self.running_session().await?;
        if self
            .data_publishing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        if let Err(source) = session
            .publish_data(
                Bytes::from_static(b"ensure connect"),
                DataReliability::Reliable,
                Some(vec![UNREACHABLE_RECIPIENT.to_string()]),
            )
            .await
        {
            self.data_publishing.store(false, Ordering::Release);
            return Err(TesterError::Publish {
                track: "data".to_string(),
                source,
            });
        }
        info!(tester = %self.params.name, ?interval, packet_bytes, "Publishing data");

        let name = self.params.name.clone();
        let cancel = self.cancel.child_token();
        let publishing = Arc::clone(&self.data_publishing);
        let body_len = packet_bytes.saturating_sub(TRAILER_LEN);

        tokio::spawn(async move {
            let released = tokio::select! {
                _ = cancel.cancelled() => false,
                result = ready.wait_for(|ready| *ready) => result.is_ok(),
            };

            if released {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let payload = stamped_payload(body_len);
                    if let Err(e) = session
                        .publish_data(payload, DataReliability::Reliable, None)
                        .await
                    {
                        warn!(tester = %name, error = %e, "Error publishing data");
                    }
                }
            }
            publishing.store(false, Ordering::Release);
        });

        Ok(())
    }

    /// Raise or clear this tester's active-speaker flag
    pub async fn set_speaking(&self, speaking: bool) -> Result<(), TesterError> {
        let session = self.running_session().await?;
        session.set_speaking(speaking).await?;
        Ok(())
    }

    pub fn stats(&self) -> TesterStats {
        self.ledger.snapshot(self.params.expected_tracks)
    }

    pub fn reset_stats(&self) {
        self.ledger.reset();
    }

    /// Flip to `Stopped` and cancel every loop. Returns false if the tester
    /// had already left `Running` for good.
    pub fn signal_stop(&self) -> bool {
        self.cancel.cancel();
        loop {
            let current = self.state.load();
            if current.is_terminal() {
                return false;
            }
            if self.state.transition(current, TesterState::Stopped) {
                return true;
            }
        }
    }

    /// Disconnect the session, if one is held
    pub async fn release(&self) {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            session.disconnect().await;
            debug!(tester = %self.params.name, "Session released");
        }
    }

    /// Stop the tester. Stopping a stopped tester does nothing.
    pub async fn stop(&self) {
        if self.signal_stop() {
            self.release().await;
        }
    }
}

impl std::fmt::Debug for Tester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tester")
            .field("name", &self.params.name)
            .field("room", &self.params.room)
            .field("state", &self.state.load())
            .finish()
    }
}
