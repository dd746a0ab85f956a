//! Inbound side of a tester: the session event loop and per-track consumers

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::media::rtp::{DEFAULT_MAX_LATE, SampleBuilder};
use crate::media::{Dimensions, TrackKind};
use crate::session::{RemoteTrack, Session, SessionEvent};
use crate::stats::latency::{latency_sample, now_nanos};
use crate::stats::{Ledger, Observation};

/// Consumes one tester's session events until the session ends or the
/// tester is canceled
pub(super) struct EventLoop {
    pub name: String,
    pub session: Arc<dyn Session>,
    pub ledger: Arc<Ledger>,
    /// Subscribe to tracks and count data; publishers only drain events
    pub subscribe: bool,
    /// Layer to request on subscribed video; `None` keeps the default layer
    pub steering: Option<Dimensions>,
    pub cancel: CancellationToken,
}

impl EventLoop {
    pub async fn run(self, mut events: mpsc::Receiver<SessionEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                SessionEvent::TrackPublished(publication) => {
                    if self.subscribe {
                        self.subscribe_to(&publication.sid).await;
                    }
                }
                SessionEvent::TrackSubscribed(track) => self.on_track_subscribed(track).await,
                SessionEvent::TrackSubscriptionFailed { track_sid, reason } => {
                    warn!(tester = %self.name, track = %track_sid, %reason, "Track subscription failed");
                }
                SessionEvent::DataReceived {
                    payload,
                    sender_sid,
                    ..
                } => {
                    if self.subscribe {
                        self.on_data(&payload, &sender_sid);
                    }
                }
                SessionEvent::ActiveSpeakersChanged(speakers) => {
                    debug!(tester = %self.name, ?speakers, "Active speakers changed");
                }
            }
        }
        debug!(tester = %self.name, "Event loop finished");
    }

    pub async fn subscribe_to(&self, track_sid: &str) {
        if let Err(e) = self.session.set_subscribed(track_sid).await {
            warn!(tester = %self.name, track = %track_sid, error = %e, "Could not subscribe");
        }
    }

    async fn on_track_subscribed(&self, track: RemoteTrack) {
        let kind = track.kind();
        self.ledger.register(track.sid(), kind);
        debug!(tester = %self.name, track = %track.sid(), %kind, "Subscribed to track");

        if kind == TrackKind::Video
            && let Some(dimensions) = self.steering
            && let Err(e) = self.session.set_video_dimensions(track.sid(), dimensions).await
        {
            warn!(tester = %self.name, track = %track.sid(), error = %e, "Could not select video layer");
        }

        tokio::spawn(consume_track(
            track,
            Arc::clone(&self.ledger),
            self.cancel.child_token(),
        ));
    }

    /// Data is keyed by the sending participant
    fn on_data(&self, payload: &Bytes, sender_sid: &str) {
        let latency = latency_sample(payload, now_nanos());
        self.ledger.record(
            sender_sid,
            TrackKind::Data,
            Observation::Packet {
                bytes: payload.len(),
                latency,
            },
        );
    }
}

/// Read a track until it ends, recording every reassembled packet.
///
/// A keyframe is requested up front and again whenever the sample builder
/// gives up on packets of a video track.
pub(super) async fn consume_track(mut track: RemoteTrack, ledger: Arc<Ledger>, cancel: CancellationToken) {
    let kind = track.kind();
    let track_id = track.sid().to_string();
    let mut builder = SampleBuilder::new(track.codec(), DEFAULT_MAX_LATE);

    track.request_keyframe();

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = track.read_rtp() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        builder.push(packet);

        for sample in builder.pop() {
            let now = now_nanos();
            let last = sample.packets.len().saturating_sub(1);
            for (index, packet) in sample.packets.iter().enumerate() {
                // Publishers stamp the end of the sample, which is the last packet
                let latency = if index == last && kind.carries_latency_trailer() {
                    latency_sample(&packet.payload, now)
                } else {
                    None
                };
                ledger.record(
                    &track_id,
                    kind,
                    Observation::Packet {
                        bytes: packet.payload.len(),
                        latency,
                    },
                );
            }
        }

        let dropped = builder.take_dropped();
        if dropped > 0 {
            ledger.record(&track_id, kind, Observation::Dropped(dropped));
            if kind == TrackKind::Video {
                track.request_keyframe();
            }
        }
    }

    debug!(track = %track_id, "Track consumer finished");
}
