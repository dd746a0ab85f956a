//! In-process room service
//!
//! Routes published tracks and data packets between sessions that joined the
//! same room name. Each subscription gets its own bounded packet queue and its
//! own sequence numbering, so loss injected here (random loss, full queues)
//! shows up at the subscriber as sequence gaps, exactly like network loss.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::{
    ConnectInfo, DataReliability, KeyframeRequester, LocalTrack, RemotePublication, RemoteTrack, Session,
    SessionError, SessionEvent, TrackHandle, Transport,
};
use crate::media::rtp::{DEFAULT_MTU, Packetizer, RtpPacket};
use crate::media::{Dimensions, MediaSource, VideoLayer};

/// URL scheme served by this transport
pub const LOOPBACK_SCHEME: &str = "loopback://";

const EVENT_QUEUE_DEPTH: usize = 1024;

/// Fault injection and sizing for the loopback service
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Probability in [0, 1] that a forwarded packet is lost
    pub packet_loss: f64,
    /// Number of connect attempts, across all sessions, that fail before
    /// connects start succeeding
    pub connect_failures: u32,
    /// Identities containing any of these substrings are always refused
    pub refused_identities: Vec<String>,
    /// Packets buffered per subscription before new ones are dropped
    pub queue_depth: usize,
    pub mtu: usize,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            packet_loss: 0.0,
            connect_failures: 0,
            refused_identities: Vec::new(),
            queue_depth: 256,
            mtu: DEFAULT_MTU,
        }
    }
}

/// `Transport` backed by an in-process hub of rooms
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    hub: Arc<Hub>,
}

impl LoopbackTransport {
    pub fn new(mut options: LoopbackOptions) -> Self {
        options.packet_loss = options.packet_loss.clamp(0.0, 1.0);
        options.queue_depth = options.queue_depth.max(1);
        Self {
            hub: Arc::new(Hub {
                options,
                rooms: DashMap::new(),
                connect_attempts: AtomicU32::new(0),
                data_messages: AtomicU64::new(0),
            }),
        }
    }

    /// Rooms with at least one participant
    pub fn room_count(&self) -> usize {
        self.hub.rooms.len()
    }

    /// Data packets accepted from publishers, delivered or not
    pub fn data_messages(&self) -> u64 {
        self.hub.data_messages.load(Ordering::Relaxed)
    }

    pub fn participant_count(&self, room: &str) -> usize {
        self.hub
            .rooms
            .get(room)
            .map(|r| r.participants.len())
            .unwrap_or(0)
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(LoopbackOptions::default())
    }
}

impl Transport for LoopbackTransport {
    fn create_session(&self) -> (Arc<dyn Session>, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let session = LoopbackSession {
            hub: Arc::clone(&self.hub),
            events: tx,
            state: RwLock::new(None),
        };
        (Arc::new(session), rx)
    }
}

#[derive(Debug)]
struct Hub {
    options: LoopbackOptions,
    rooms: DashMap<String, Arc<Room>>,
    connect_attempts: AtomicU32,
    data_messages: AtomicU64,
}

#[derive(Debug, Default)]
struct Room {
    participants: DashMap<String, Arc<Participant>>,
}

impl Room {
    /// Find a track published by someone other than `exclude_sid`
    fn find_publication(&self, track_sid: &str, exclude_sid: &str) -> Option<Arc<Publication>> {
        self.participants
            .iter()
            .filter(|p| p.sid != exclude_sid)
            .find_map(|p| p.publications.get(track_sid).map(|publication| Arc::clone(&publication)))
    }

    fn broadcast_speakers(&self) {
        let speakers: Vec<String> = self
            .participants
            .iter()
            .filter(|p| p.speaking.load(Ordering::Relaxed))
            .map(|p| p.identity.clone())
            .collect();

        for participant in self.participants.iter() {
            let _ = participant
                .events
                .try_send(SessionEvent::ActiveSpeakersChanged(speakers.clone()));
        }
    }
}

#[derive(Debug)]
struct Participant {
    sid: String,
    identity: String,
    events: mpsc::Sender<SessionEvent>,
    publications: DashMap<String, Arc<Publication>>,
    speaking: AtomicBool,
}

#[derive(Debug)]
struct Publication {
    info: RemotePublication,
    keyframes: KeyframeRequester,
    /// Keyed by subscriber participant sid
    subscribers: DashMap<String, Arc<Subscription>>,
}

impl Publication {
    /// Deliver one layer's packets to every subscriber currently on that layer
    fn forward(&self, layer: usize, packets: &[RtpPacket], packet_loss: f64) {
        let mut rng = rand::rng();
        for subscription in self.subscribers.iter() {
            if subscription.layer.load(Ordering::Relaxed) != layer {
                continue;
            }
            for packet in packets {
                let sequence_number = subscription.next_sequence.fetch_add(1, Ordering::Relaxed);
                if packet_loss > 0.0 && rng.random_bool(packet_loss) {
                    continue;
                }
                let mut packet = packet.clone();
                packet.sequence_number = sequence_number;
                // A full queue loses the packet, like a congested link
                let _ = subscription.packets.try_send(packet);
            }
        }
    }
}

#[derive(Debug)]
struct Subscription {
    /// Index into the publication's layers
    layer: AtomicUsize,
    next_sequence: AtomicU16,
    packets: mpsc::Sender<RtpPacket>,
}

#[derive(Debug, Clone)]
struct Connected {
    room_name: String,
    room: Arc<Room>,
    participant: Arc<Participant>,
    cancel: CancellationToken,
}

/// One participant in the loopback hub
#[derive(Debug)]
pub struct LoopbackSession {
    hub: Arc<Hub>,
    events: mpsc::Sender<SessionEvent>,
    state: RwLock<Option<Connected>>,
}

impl LoopbackSession {
    async fn connected(&self) -> Result<Connected, SessionError> {
        self.state.read().await.clone().ok_or(SessionError::NotConnected)
    }

    fn leave(hub: &Hub, conn: Connected) {
        conn.cancel.cancel();
        let me = &conn.participant.sid;
        conn.room.participants.remove(me);

        // End every remote track fed by our publications or consumed by us
        for publication in conn.participant.publications.iter() {
            publication.subscribers.clear();
        }
        conn.participant.publications.clear();
        for other in conn.room.participants.iter() {
            for publication in other.publications.iter() {
                publication.subscribers.remove(me);
            }
        }

        hub.rooms
            .remove_if(&conn.room_name, |_, room| room.participants.is_empty());
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Lowest layer that still covers the requested dimensions
fn select_layer(layers: &[VideoLayer], wanted: Dimensions) -> usize {
    layers
        .iter()
        .enumerate()
        .rev()
        .find(|(_, layer)| {
            layer.dimensions.width >= wanted.width && layer.dimensions.height >= wanted.height
        })
        .map(|(index, _)| index)
        .unwrap_or(0)
}

async fn write_layer(
    publication: Arc<Publication>,
    layer: usize,
    mut source: Box<dyn MediaSource>,
    options: (usize, f64),
    cancel: CancellationToken,
) {
    let (mtu, packet_loss) = options;
    let mut packetizer = Packetizer::new(source.codec(), rand::random(), mtu);
    let mut served = publication.keyframes.generation();

    loop {
        let requested = publication.keyframes.generation();
        if requested != served {
            source.request_keyframe();
            served = requested;
        }

        let Some(sample) = source.next_sample() else {
            break;
        };
        let packets = packetizer.packetize(&sample.data, sample.duration);
        publication.forward(layer, &packets, packet_loss);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(sample.duration) => {}
        }
    }
}

#[async_trait]
impl Session for LoopbackSession {
    async fn connect(&self, info: &ConnectInfo) -> Result<(), SessionError> {
        if !info.url.starts_with(LOOPBACK_SCHEME) {
            return Err(SessionError::UnsupportedUrl(info.url.clone()));
        }

        let mut state = self.state.write().await;
        if state.is_some() {
            return Err(SessionError::AlreadyConnected);
        }

        let options = &self.hub.options;
        let attempt = self.hub.connect_attempts.fetch_add(1, Ordering::Relaxed);
        if attempt < options.connect_failures {
            return Err(SessionError::ConnectionRefused(format!(
                "injected failure {} of {}",
                attempt + 1,
                options.connect_failures
            )));
        }
        if options
            .refused_identities
            .iter()
            .any(|pattern| info.identity.contains(pattern.as_str()))
        {
            return Err(SessionError::ConnectionRefused(format!(
                "identity {} is refused",
                info.identity
            )));
        }

        let participant = Arc::new(Participant {
            sid: format!("PA_{}", short_id()),
            identity: info.identity.clone(),
            events: self.events.clone(),
            publications: DashMap::new(),
            speaking: AtomicBool::new(false),
        });

        // Insert under the entry lock so an emptying room cannot be removed underneath us
        let room = {
            let entry = self.hub.rooms.entry(info.room.clone()).or_default();
            entry
                .participants
                .insert(participant.sid.clone(), Arc::clone(&participant));
            Arc::clone(entry.value())
        };

        debug!(room = %info.room, identity = %info.identity, sid = %participant.sid, "Loopback participant joined");

        *state = Some(Connected {
            room_name: info.room.clone(),
            room,
            participant,
            cancel: CancellationToken::new(),
        });
        Ok(())
    }

    async fn publish_track(&self, track: LocalTrack) -> Result<TrackHandle, SessionError> {
        let conn = self.connected().await?;

        let Some(codec) = track.codec() else {
            return Err(SessionError::InvalidTrack(format!("{} has no sources", track.name)));
        };
        if codec.kind() != track.kind || track.sources.iter().any(|s| s.codec() != codec) {
            return Err(SessionError::InvalidTrack(format!(
                "{} mixes codecs or does not match kind {}",
                track.name, track.kind
            )));
        }

        let info = RemotePublication {
            sid: format!("TR_{}", short_id()),
            name: track.name.clone(),
            kind: track.kind,
            codec,
            participant_sid: conn.participant.sid.clone(),
            participant_identity: conn.participant.identity.clone(),
            layers: track.sources.iter().filter_map(|s| s.layer()).collect(),
        };
        let publication = Arc::new(Publication {
            info: info.clone(),
            keyframes: KeyframeRequester::new(),
            subscribers: DashMap::new(),
        });
        conn.participant
            .publications
            .insert(info.sid.clone(), Arc::clone(&publication));

        let options = (self.hub.options.mtu, self.hub.options.packet_loss);
        for (layer, source) in track.sources.into_iter().enumerate() {
            tokio::spawn(write_layer(
                Arc::clone(&publication),
                layer,
                source,
                options,
                conn.cancel.child_token(),
            ));
        }

        for other in conn.room.participants.iter() {
            if other.sid != conn.participant.sid {
                let _ = other
                    .events
                    .try_send(SessionEvent::TrackPublished(info.clone()));
            }
        }

        debug!(track = %info.sid, name = %info.name, kind = %info.kind, "Loopback track published");
        Ok(TrackHandle {
            sid: info.sid,
            name: info.name,
        })
    }

    async fn publish_data(
        &self,
        payload: Bytes,
        reliability: DataReliability,
        recipients: Option<Vec<String>>,
    ) -> Result<(), SessionError> {
        let conn = self.connected().await?;
        self.hub.data_messages.fetch_add(1, Ordering::Relaxed);

        let targets: Vec<mpsc::Sender<SessionEvent>> = conn
            .room
            .participants
            .iter()
            .filter(|p| p.sid != conn.participant.sid)
            .filter(|p| {
                recipients
                    .as_ref()
                    .is_none_or(|ids| ids.iter().any(|id| *id == p.identity))
            })
            .map(|p| p.events.clone())
            .collect();

        for target in targets {
            let event = SessionEvent::DataReceived {
                payload: payload.clone(),
                sender_sid: conn.participant.sid.clone(),
                sender_identity: conn.participant.identity.clone(),
            };
            match reliability {
                // Receiver gone is not a sender error
                DataReliability::Reliable => {
                    let _ = target.send(event).await;
                }
                DataReliability::Lossy => {
                    let _ = target.try_send(event);
                }
            }
        }
        Ok(())
    }

    async fn set_subscribed(&self, track_sid: &str) -> Result<(), SessionError> {
        let conn = self.connected().await?;
        let me = &conn.participant.sid;

        let Some(publication) = conn.room.find_publication(track_sid, me) else {
            let _ = self.events.try_send(SessionEvent::TrackSubscriptionFailed {
                track_sid: track_sid.to_string(),
                reason: "track is not published in this room".to_string(),
            });
            return Ok(());
        };

        if publication.subscribers.contains_key(me) {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(self.hub.options.queue_depth);
        publication.subscribers.insert(
            me.clone(),
            Arc::new(Subscription {
                layer: AtomicUsize::new(0),
                next_sequence: AtomicU16::new(rand::random()),
                packets: tx,
            }),
        );

        let track = RemoteTrack::new(publication.info.clone(), rx, publication.keyframes.clone());
        if self
            .events
            .try_send(SessionEvent::TrackSubscribed(track))
            .is_err()
        {
            warn!(track = %track_sid, "Event queue full, dropping subscription");
            publication.subscribers.remove(me);
        }
        Ok(())
    }

    async fn set_video_dimensions(&self, track_sid: &str, dimensions: Dimensions) -> Result<(), SessionError> {
        let conn = self.connected().await?;
        let me = &conn.participant.sid;

        let publication = conn
            .room
            .find_publication(track_sid, me)
            .ok_or_else(|| SessionError::UnknownTrack(track_sid.to_string()))?;
        let subscription = publication
            .subscribers
            .get(me)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| SessionError::UnknownTrack(track_sid.to_string()))?;

        let layer = select_layer(&publication.info.layers, dimensions);
        if subscription.layer.swap(layer, Ordering::Relaxed) != layer {
            publication.keyframes.request();
        }
        Ok(())
    }

    async fn set_speaking(&self, speaking: bool) -> Result<(), SessionError> {
        let conn = self.connected().await?;
        if conn.participant.speaking.swap(speaking, Ordering::Relaxed) != speaking {
            conn.room.broadcast_speakers();
        }
        Ok(())
    }

    async fn remote_publications(&self) -> Vec<RemotePublication> {
        let Ok(conn) = self.connected().await else {
            return Vec::new();
        };

        conn.room
            .participants
            .iter()
            .filter(|p| p.sid != conn.participant.sid)
            .flat_map(|p| {
                p.publications
                    .iter()
                    .map(|publication| publication.info.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    async fn disconnect(&self) {
        let Some(conn) = self.state.write().await.take() else {
            return;
        };
        debug!(room = %conn.room_name, identity = %conn.participant.identity, "Loopback participant left");
        Self::leave(&self.hub, conn);
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        if let Some(conn) = self.state.get_mut().take() {
            Self::leave(&self.hub, conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Codec, MediaCatalog, TrackKind};

    fn info(room: &str, identity: &str) -> ConnectInfo {
        ConnectInfo {
            url: "loopback://local".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            room: room.to_string(),
            identity: identity.to_string(),
        }
    }

    async fn join(
        transport: &LoopbackTransport,
        room: &str,
        identity: &str,
    ) -> (Arc<dyn Session>, mpsc::Receiver<SessionEvent>) {
        let (session, events) = transport.create_session();
        session.connect(&info(room, identity)).await.unwrap();
        (session, events)
    }

    async fn next_subscribed(events: &mut mpsc::Receiver<SessionEvent>) -> RemoteTrack {
        loop {
            match events.recv().await {
                Some(SessionEvent::TrackSubscribed(track)) => return track,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_rejects_unknown_scheme() {
        let transport = LoopbackTransport::default();
        let (session, _events) = transport.create_session();
        let mut bad = info("room", "a");
        bad.url = "wss://example.com".to_string();

        let result = session.connect(&bad).await;
        assert!(matches!(result, Err(SessionError::UnsupportedUrl(_))));
    }

    #[tokio::test]
    async fn test_injected_connect_failures() {
        let transport = LoopbackTransport::new(LoopbackOptions {
            connect_failures: 2,
            ..Default::default()
        });
        let (session, _events) = transport.create_session();

        assert!(session.connect(&info("room", "a")).await.is_err());
        assert!(session.connect(&info("room", "a")).await.is_err());
        assert!(session.connect(&info("room", "a")).await.is_ok());
        assert!(matches!(
            session.connect(&info("room", "a")).await,
            Err(SessionError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_refused_identity() {
        let transport = LoopbackTransport::new(LoopbackOptions {
            refused_identities: vec!["_pub".to_string()],
            ..Default::default()
        });
        let (publisher, _) = transport.create_session();
        let (subscriber, _) = transport.create_session();

        assert!(publisher.connect(&info("room", "abc_pubroom_0")).await.is_err());
        assert!(subscriber.connect(&info("room", "abc_subroom_0")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_subscribe_flow() {
        let transport = LoopbackTransport::default();
        let catalog = MediaCatalog::new(Codec::H264);

        let (publisher, _pub_events) = join(&transport, "room", "pub").await;
        let (subscriber, mut sub_events) = join(&transport, "room", "sub").await;

        let handle = publisher
            .publish_track(LocalTrack::new(
                "video",
                TrackKind::Video,
                vec![catalog.video_source("360p").unwrap()],
            ))
            .await
            .unwrap();

        match sub_events.recv().await {
            Some(SessionEvent::TrackPublished(publication)) => {
                assert_eq!(publication.sid, handle.sid);
                assert_eq!(publication.participant_identity, "pub");
                assert_eq!(publication.layers.len(), 1);
            }
            other => panic!("expected TrackPublished, got {:?}", other),
        }

        subscriber.set_subscribed(&handle.sid).await.unwrap();
        let mut track = next_subscribed(&mut sub_events).await;
        assert_eq!(track.kind(), TrackKind::Video);

        let first = track.read_rtp().await.expect("packet");
        let second = track.read_rtp().await.expect("packet");
        assert_eq!(second.sequence_number, first.sequence_number.wrapping_add(1));

        publisher.disconnect().await;
        // Drain whatever was queued, then the track ends
        while track.read_rtp().await.is_some() {}
        assert_eq!(transport.participant_count("room"), 1);
    }

    #[tokio::test]
    async fn test_late_joiner_sees_existing_publications() {
        let transport = LoopbackTransport::default();
        let catalog = MediaCatalog::new(Codec::H264);

        let (publisher, _) = join(&transport, "room", "pub").await;
        publisher
            .publish_track(LocalTrack::new("audio", TrackKind::Audio, vec![catalog.audio_source()]))
            .await
            .unwrap();

        let (subscriber, _) = join(&transport, "room", "sub").await;
        let publications = subscriber.remote_publications().await;
        assert_eq!(publications.len(), 1);
        assert_eq!(publications[0].kind, TrackKind::Audio);

        // Our own tracks are not remote
        assert!(publisher.remote_publications().await.is_empty());
        publisher.disconnect().await;
    }

    #[tokio::test]
    async fn test_subscribe_to_missing_track_reports_failure() {
        let transport = LoopbackTransport::default();
        let (subscriber, mut events) = join(&transport, "room", "sub").await;

        subscriber.set_subscribed("TR_missing").await.unwrap();
        match events.recv().await {
            Some(SessionEvent::TrackSubscriptionFailed { track_sid, .. }) => {
                assert_eq!(track_sid, "TR_missing")
            }
            other => panic!("expected TrackSubscriptionFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_data_respects_recipients() {
        let transport = LoopbackTransport::default();
        let (sender, _) = join(&transport, "room", "sender").await;
        let (_receiver, mut events) = join(&transport, "room", "receiver").await;

        sender
            .publish_data(
                Bytes::from_static(b"ensure connect"),
                DataReliability::Reliable,
                Some(vec!["unexist".to_string()]),
            )
            .await
            .unwrap();
        sender
            .publish_data(Bytes::from_static(b"hello"), DataReliability::Reliable, None)
            .await
            .unwrap();

        match events.recv().await {
            Some(SessionEvent::DataReceived {
                payload,
                sender_identity,
                ..
            }) => {
                assert_eq!(payload.as_ref(), b"hello");
                assert_eq!(sender_identity, "sender");
            }
            other => panic!("expected DataReceived, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_speaking_broadcast() {
        let transport = LoopbackTransport::default();
        let (speaker, _) = join(&transport, "room", "speaker").await;
        let (_listener, mut events) = join(&transport, "room", "listener").await;

        speaker.set_speaking(true).await.unwrap();
        match events.recv().await {
            Some(SessionEvent::ActiveSpeakersChanged(speakers)) => {
                assert_eq!(speakers, vec!["speaker".to_string()])
            }
            other => panic!("expected ActiveSpeakersChanged, got {:?}", other),
        }

        speaker.set_speaking(false).await.unwrap();
        match events.recv().await {
            Some(SessionEvent::ActiveSpeakersChanged(speakers)) => assert!(speakers.is_empty()),
            other => panic!("expected ActiveSpeakersChanged, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_dimensions_select_layer() {
        let transport = LoopbackTransport::default();
        let catalog = MediaCatalog::new(Codec::H264);

        let (publisher, _) = join(&transport, "room", "pub").await;
        let (subscriber, mut events) = join(&transport, "room", "sub").await;
        let handle = publisher
            .publish_track(LocalTrack::new(
                "video-simulcast",
                TrackKind::Video,
                catalog.simulcast_sources("1080p").unwrap(),
            ))
            .await
            .unwrap();

        subscriber.set_subscribed(&handle.sid).await.unwrap();
        let mut track = next_subscribed(&mut events).await;
        subscriber
            .set_video_dimensions(&handle.sid, Dimensions::new(640, 360))
            .await
            .unwrap();

        // Two seconds of frames: HIGH at 1080p needs ~18 packets per frame,
        // LOW fits in two or three
        let mut frames = 0;
        let mut packets = 0;
        while frames < 48 {
            let packet = track.read_rtp().await.expect("packet");
            packets += 1;
            if packet.marker {
                frames += 1;
            }
        }
        assert!(packets < 48 * 5, "{} packets for 48 frames", packets);

        assert!(matches!(
            subscriber
                .set_video_dimensions("TR_missing", Dimensions::new(640, 360))
                .await,
            Err(SessionError::UnknownTrack(_))
        ));
    }

    #[test]
    fn test_select_layer() {
        let catalog = MediaCatalog::new(Codec::H264);
        let layers: Vec<VideoLayer> = crate::media::VideoQuality::ALL
            .iter()
            .map(|q| catalog.video_layer("1080p", *q).unwrap())
            .collect();

        assert_eq!(select_layer(&layers, Dimensions::new(1920, 1080)), 0);
        assert_eq!(select_layer(&layers, Dimensions::new(800, 450)), 1);
        assert_eq!(select_layer(&layers, Dimensions::new(640, 360)), 2);
        assert_eq!(select_layer(&layers, Dimensions::new(4096, 2160)), 0);
        assert_eq!(select_layer(&[], Dimensions::new(640, 360)), 0);
    }
}
