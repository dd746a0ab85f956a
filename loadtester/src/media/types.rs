//! Media-related types and error definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when building media sources
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Unsupported resolution: {0}")]
    UnsupportedResolution(String),

    #[error("Unsupported video codec: {0}")]
    UnsupportedCodec(String),

    #[error("No video layers for codec {codec} at {resolution}")]
    MissingLayers { codec: Codec, resolution: String },
}

/// Kind of an observed or published track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
    Data,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
            TrackKind::Data => "data",
        }
    }

    /// Audio and video count toward a subscriber's expected tracks; data does not
    pub fn is_media(&self) -> bool {
        match self {
            TrackKind::Video | TrackKind::Audio => true,
            TrackKind::Data => false,
        }
    }

    /// Whether payloads of this kind carry a send-timestamp trailer
    pub fn carries_latency_trailer(&self) -> bool {
        match self {
            TrackKind::Video | TrackKind::Data => true,
            TrackKind::Audio => false,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Simulcast layer a subscriber is steered to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    High,
    Medium,
    Low,
}

impl VideoQuality {
    pub const ALL: [VideoQuality; 3] = [VideoQuality::High, VideoQuality::Medium, VideoQuality::Low];

    /// Index into a resolution ladder (0 = highest)
    pub fn ladder_index(&self) -> usize {
        match self {
            VideoQuality::High => 0,
            VideoQuality::Medium => 1,
            VideoQuality::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoQuality::High => "high",
            VideoQuality::Medium => "medium",
            VideoQuality::Low => "low",
        }
    }
}

impl fmt::Display for VideoQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codecs the synthetic sources can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    Vp8,
    Opus,
}

impl Codec {
    /// RTP clock rate
    pub fn clock_rate(&self) -> u32 {
        match self {
            Codec::H264 | Codec::Vp8 => 90_000,
            Codec::Opus => 48_000,
        }
    }

    pub fn kind(&self) -> TrackKind {
        match self {
            Codec::H264 | Codec::Vp8 => TrackKind::Video,
            Codec::Opus => TrackKind::Audio,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Codec::H264 => "h264",
            Codec::Vp8 => "vp8",
            Codec::Opus => "opus",
        };
        f.write_str(name)
    }
}

impl FromStr for Codec {
    type Err = MediaError;

    /// Parses a video codec name. An empty string selects H.264.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "h264" => Ok(Codec::H264),
            "vp8" => Ok(Codec::Vp8),
            other => Err(MediaError::UnsupportedCodec(other.to_string())),
        }
    }
}

/// Width and height of one rung of a resolution ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Metadata attached to each simulcast layer so receivers can select one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoLayer {
    pub quality: VideoQuality,
    pub dimensions: Dimensions,
    /// Target bitrate in bits per second
    pub bitrate: u32,
}

/// Named resolution with its three-rung quality ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub name: &'static str,
    /// HIGH, MEDIUM, LOW
    pub ladder: [Dimensions; 3],
}

pub const DEFAULT_RESOLUTION: &str = "1080p";

const RESOLUTIONS: &[Resolution] = &[
    Resolution {
        name: "1440p",
        ladder: [
            Dimensions::new(2560, 1440),
            Dimensions::new(2048, 1152),
            Dimensions::new(1024, 576),
        ],
    },
    Resolution {
        name: "1080p",
        ladder: [
            Dimensions::new(1920, 1080),
            Dimensions::new(800, 450),
            Dimensions::new(640, 360),
        ],
    },
    Resolution {
        name: "720p",
        ladder: [
            Dimensions::new(1280, 720),
            Dimensions::new(800, 450),
            Dimensions::new(640, 360),
        ],
    },
    Resolution {
        name: "360p",
        ladder: [
            Dimensions::new(640, 360),
            Dimensions::new(640, 360),
            Dimensions::new(640, 360),
        ],
    },
];

impl Resolution {
    /// Look up a resolution ladder by name (`1080p`, `720p`, ...)
    pub fn lookup(name: &str) -> Option<&'static Resolution> {
        RESOLUTIONS.iter().find(|r| r.name == name)
    }

    pub fn dimensions(&self, quality: VideoQuality) -> Dimensions {
        self.ladder[quality.ladder_index()]
    }
}
