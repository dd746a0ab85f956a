//! Synthetic media: codecs, quality ladders, looping sources and RTP framing

pub mod rtp;
mod source;
mod types;

pub use source::{AUDIO_FRAME, MediaCatalog, MediaSample, MediaSource, SyntheticAudio, SyntheticVideo, VIDEO_FPS};
pub use types::{
    Codec, DEFAULT_RESOLUTION, Dimensions, MediaError, Resolution, TrackKind, VideoLayer, VideoQuality,
};
