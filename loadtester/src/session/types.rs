//! Session-related types and error definitions

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::rtp::RtpPacket;
use crate::media::{Codec, Dimensions, MediaSource, TrackKind, VideoLayer};

/// Errors reported by a room session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unsupported transport URL: {0}")]
    UnsupportedUrl(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Session is already connected")]
    AlreadyConnected,

    #[error("Session is not connected")]
    NotConnected,

    #[error("Invalid track: {0}")]
    InvalidTrack(String),

    #[error("Unknown track: {0}")]
    UnknownTrack(String),
}

/// Everything needed to join a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    pub room: String,
    pub identity: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataReliability {
    Reliable,
    Lossy,
}

/// A track to publish: one source per simulcast layer (a single source for
/// non-simulcast video and audio)
pub struct LocalTrack {
    pub name: String,
    pub kind: TrackKind,
    pub sources: Vec<Box<dyn MediaSource>>,
}

impl LocalTrack {
    pub fn new(name: impl Into<String>, kind: TrackKind, sources: Vec<Box<dyn MediaSource>>) -> Self {
        Self {
            name: name.into(),
            kind,
            sources,
        }
    }

    pub fn codec(&self) -> Option<Codec> {
        self.sources.first().map(|s| s.codec())
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("layers", &self.sources.len())
            .finish()
    }
}

/// Result of a successful publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackHandle {
    pub sid: String,
    pub name: String,
}

/// A track published by another participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePublication {
    pub sid: String,
    pub name: String,
    pub kind: TrackKind,
    pub codec: Codec,
    pub participant_sid: String,
    pub participant_identity: String,
    /// Empty for audio
    pub layers: Vec<VideoLayer>,
}

/// Asks a publisher for a fresh keyframe.
///
/// Shared between the subscriber and the publisher's layer writers; every
/// request bumps a generation counter that writers compare against the last
/// one they served.
#[derive(Debug, Clone, Default)]
pub struct KeyframeRequester {
    generation: Arc<AtomicU64>,
}

impl KeyframeRequester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}

/// A subscribed track: a stream of RTP packets plus a keyframe back-channel
#[derive(Debug)]
pub struct RemoteTrack {
    pub publication: RemotePublication,
    packets: mpsc::Receiver<RtpPacket>,
    keyframes: KeyframeRequester,
}

impl RemoteTrack {
    pub fn new(
        publication: RemotePublication,
        packets: mpsc::Receiver<RtpPacket>,
        keyframes: KeyframeRequester,
    ) -> Self {
        Self {
            publication,
            packets,
            keyframes,
        }
    }

    pub fn sid(&self) -> &str {
        &self.publication.sid
    }

    pub fn kind(&self) -> TrackKind {
        self.publication.kind
    }

    pub fn codec(&self) -> Codec {
        self.publication.codec
    }

    /// Next packet, or `None` once the track has ended
    pub async fn read_rtp(&mut self) -> Option<RtpPacket> {
        self.packets.recv().await
    }

    pub fn request_keyframe(&self) {
        self.keyframes.request();
    }
}

/// Inbound notifications for one session
#[derive(Debug)]
pub enum SessionEvent {
    TrackPublished(RemotePublication),
    TrackSubscribed(RemoteTrack),
    TrackSubscriptionFailed {
        track_sid: String,
        reason: String,
    },
    DataReceived {
        payload: Bytes,
        sender_sid: String,
        sender_identity: String,
    },
    /// Identities of the participants currently speaking
    ActiveSpeakersChanged(Vec<String>),
}

/// One participant's connection to a room
#[async_trait]
pub trait Session: Send + Sync {
    async fn connect(&self, info: &ConnectInfo) -> Result<(), SessionError>;

    async fn publish_track(&self, track: LocalTrack) -> Result<TrackHandle, SessionError>;

    /// Send a data packet to `recipients` (identities), or to everyone when `None`
    async fn publish_data(
        &self,
        payload: Bytes,
        reliability: DataReliability,
        recipients: Option<Vec<String>>,
    ) -> Result<(), SessionError>;

    /// Subscribe to a remote track. The outcome arrives as a
    /// `TrackSubscribed` or `TrackSubscriptionFailed` event.
    async fn set_subscribed(&self, track_sid: &str) -> Result<(), SessionError>;

    /// Ask for the simulcast layer closest to `dimensions`
    async fn set_video_dimensions(&self, track_sid: &str, dimensions: Dimensions) -> Result<(), SessionError>;

    async fn set_speaking(&self, speaking: bool) -> Result<(), SessionError>;

    /// Tracks published by other participants at the time of the call
    async fn remote_publications(&self) -> Vec<RemotePublication>;

    async fn disconnect(&self);
}

/// Creates sessions for testers
pub trait Transport: Send + Sync {
    /// A fresh, unconnected session and the receiving end of its event channel
    fn create_session(&self) -> (Arc<dyn Session>, mpsc::Receiver<SessionEvent>);
}
