//! Simulated active speakers
//!
//! Every tick a random non-empty subset of the running publishers raises its
//! speaking flag for a while, then clears it.

use rand::Rng;
use rand::seq::IndexedRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tester::Tester;

pub struct SpeakerSimulator {
    publishers: Vec<Arc<Tester>>,
    interval: Duration,
    speaking: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SpeakerSimulator {
    pub fn new(
        publishers: Vec<Arc<Tester>>,
        interval: Duration,
        speaking: Duration,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            publishers,
            interval,
            speaking,
            cancel: cancel.child_token(),
            task: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.task.is_some()
    }

    /// Spawn the tick loop. Does nothing without publishers or when already
    /// started.
    pub fn start(&mut self) {
        if self.publishers.is_empty() || self.task.is_some() {
            return;
        }
        info!(publishers = self.publishers.len(), interval = ?self.interval, "Simulating speakers");

        let publishers = self.publishers.clone();
        let interval = self.interval;
        let speaking = self.speaking;
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(run(publishers, interval, speaking, cancel)));
    }

    /// Stop ticking. Once this returns, no speaker is raised again and the
    /// last speakers have been cleared.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Speaker simulator task failed");
        }
    }
}

async fn run(
    publishers: Vec<Arc<Tester>>,
    interval: Duration,
    speaking: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let speakers = pick_speakers(&publishers);
        if speakers.is_empty() {
            continue;
        }
        debug!(speakers = speakers.len(), "Raising active speakers");
        set_speaking(&speakers, true).await;

        let canceled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(speaking) => false,
        };
        set_speaking(&speakers, false).await;
        if canceled {
            break;
        }
    }

    debug!("Speaker simulator finished");
}

/// Random non-empty subset of the publishers that are still running
fn pick_speakers(publishers: &[Arc<Tester>]) -> Vec<Arc<Tester>> {
    let running: Vec<&Arc<Tester>> = publishers.iter().filter(|p| p.is_running()).collect();
    if running.is_empty() {
        return Vec::new();
    }
    let mut rng = rand::rng();
    let count = rng.random_range(1..=running.len());
    running
        .choose_multiple(&mut rng, count)
        .map(|p| Arc::clone(*p))
        .collect()
}

async fn set_speaking(speakers: &[Arc<Tester>], speaking: bool) {
    for speaker in speakers {
        if let Err(e) = speaker.set_speaking(speaking).await {
            debug!(tester = %speaker.name(), error = %e, "Could not change speaking state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::media::VideoQuality;
    use crate::session::{ConnectInfo, LoopbackTransport, Session, SessionEvent, Transport};
    use crate::tester::{TesterParams, TesterRole};
    use tokio::sync::mpsc::error::TryRecvError;

    fn publisher(transport: &Arc<LoopbackTransport>, index: usize) -> Arc<Tester> {
        let params = TesterParams {
            name: format!("Pub {}", index),
            identity: format!("speaker_{}", index),
            room: "room".to_string(),
            role: TesterRole::Publisher,
            quality: VideoQuality::High,
            resolution: "360p".to_string(),
            same_room: true,
            expected_tracks: 0,
            connection: ConnectionConfig::default(),
        };
        Arc::new(Tester::new(
            params,
            Arc::clone(transport) as Arc<dyn Transport>,
            CancellationToken::new(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_speakers_raised_and_cleared_on_stop() {
        let transport = Arc::new(LoopbackTransport::default());
        let publishers: Vec<_> = (0..3).map(|i| publisher(&transport, i)).collect();
        for p in &publishers {
            p.start().await.unwrap();
        }

        let (observer, mut events) = transport.create_session();
        observer
            .connect(&ConnectInfo {
                url: "loopback://local".to_string(),
                api_key: String::new(),
                api_secret: String::new(),
                room: "room".to_string(),
                identity: "observer".to_string(),
            })
            .await
            .unwrap();

        let mut simulator = SpeakerSimulator::new(
            publishers.clone(),
            Duration::from_secs(1),
            Duration::from_millis(500),
            &CancellationToken::new(),
        );
        simulator.start();
        assert!(simulator.is_started());

        // Inside the first speaking window
        tokio::time::sleep(Duration::from_millis(1200)).await;
        simulator.stop().await;

        let mut changes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::ActiveSpeakersChanged(speakers) = event {
                changes.push(speakers);
            }
        }
        assert!(changes.iter().any(|s| !s.is_empty()));
        assert_eq!(changes.last(), Some(&Vec::new()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        for p in &publishers {
            p.stop().await;
        }
    }

    #[tokio::test]
    async fn test_no_publishers_never_starts() {
        let mut simulator = SpeakerSimulator::new(
            Vec::new(),
            Duration::from_secs(1),
            Duration::from_millis(500),
            &CancellationToken::new(),
        );
        simulator.start();
        assert!(!simulator.is_started());
        simulator.stop().await;
    }

    #[tokio::test]
    async fn test_pick_skips_stopped_publishers() {
        let transport = Arc::new(LoopbackTransport::default());
        let running = publisher(&transport, 0);
        let idle = publisher(&transport, 1);
        running.start().await.unwrap();

        for _ in 0..20 {
            let picked = pick_speakers(&[Arc::clone(&running), Arc::clone(&idle)]);
            assert_eq!(picked.len(), 1);
            assert_eq!(picked[0].name(), "Pub 0");
        }
        running.stop().await;
        assert!(pick_speakers(&[running]).is_empty());
    }
}
