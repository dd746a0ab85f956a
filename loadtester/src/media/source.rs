//! Synthetic looping media sources
//!
//! Sources produce encoded-looking samples at the configured bitrate and frame
//! rate. Video samples are shaped like H.264 NAL units (or VP8 frames) and end
//! with the send-timestamp trailer; audio samples are fixed-size Opus frames.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::types::{Codec, MediaError, Resolution, VideoLayer, VideoQuality};
use crate::stats::latency::{TRAILER_LEN, append_trailer, now_nanos};

/// Frame rate of every video source
pub const VIDEO_FPS: u32 = 24;

/// Duration of one Opus frame
pub const AUDIO_FRAME: Duration = Duration::from_millis(20);

/// Opus frame size, roughly 32 kbps
const AUDIO_FRAME_BYTES: usize = 80;

/// Frames per loop; the first frame of each loop is a keyframe
const CLIP_FRAMES: u64 = VIDEO_FPS as u64 * 10;

/// Number of distinct synthetic clips the catalog rotates through
const CLIP_COUNT: usize = 4;

const H264_IDR: u8 = 0x65;
const H264_NON_IDR: u8 = 0x41;
const OPUS_TOC: u8 = 0xFC;

/// One encoded sample ready for packetization
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
}

/// Endless source of encoded samples for one track (or one simulcast layer)
pub trait MediaSource: Send + 'static {
    fn codec(&self) -> Codec;

    /// Simulcast metadata; `None` for audio
    fn layer(&self) -> Option<VideoLayer>;

    /// Next sample, or `None` once the source is exhausted
    fn next_sample(&mut self) -> Option<MediaSample>;

    /// Emit a keyframe as the next sample
    fn request_keyframe(&mut self) {}
}

/// Looping video source shaped by a layer's bitrate
#[derive(Debug)]
pub struct SyntheticVideo {
    codec: Codec,
    layer: VideoLayer,
    clip: u8,
    frame: u64,
    force_keyframe: bool,
}

impl SyntheticVideo {
    pub fn new(codec: Codec, layer: VideoLayer, clip: usize) -> Self {
        Self {
            codec,
            layer,
            clip: clip as u8,
            frame: 0,
            force_keyframe: false,
        }
    }

    fn frame_len(&self, keyframe: bool) -> usize {
        let average = (self.layer.bitrate / 8 / VIDEO_FPS) as usize;
        let len = if keyframe { average * 3 } else { average };
        len.max(TRAILER_LEN * 2)
    }
}

impl MediaSource for SyntheticVideo {
    fn codec(&self) -> Codec {
        self.codec
    }

    fn layer(&self) -> Option<VideoLayer> {
        Some(self.layer)
    }

    fn next_sample(&mut self) -> Option<MediaSample> {
        let keyframe = self.force_keyframe || self.frame % CLIP_FRAMES == 0;
        self.force_keyframe = false;
        self.frame += 1;

        let len = self.frame_len(keyframe);
        let mut buf = BytesMut::with_capacity(len);
        match self.codec {
            Codec::H264 => buf.put_u8(if keyframe { H264_IDR } else { H264_NON_IDR }),
            // VP8 frame tag: bit 0 clear marks a keyframe
            _ => buf.put_u8(if keyframe { 0x00 } else { 0x01 }),
        }
        buf.resize(len - TRAILER_LEN, self.clip);
        append_trailer(&mut buf, now_nanos());

        Some(MediaSample {
            data: buf.freeze(),
            duration: Duration::from_secs(1) / VIDEO_FPS,
        })
    }

    fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }
}

/// Looping Opus source
#[derive(Debug, Default)]
pub struct SyntheticAudio {
    clip: u8,
}

impl SyntheticAudio {
    pub fn new(clip: usize) -> Self {
        Self { clip: clip as u8 }
    }
}

impl MediaSource for SyntheticAudio {
    fn codec(&self) -> Codec {
        Codec::Opus
    }

    fn layer(&self) -> Option<VideoLayer> {
        None
    }

    fn next_sample(&mut self) -> Option<MediaSample> {
        let mut buf = BytesMut::with_capacity(AUDIO_FRAME_BYTES);
        buf.put_u8(OPUS_TOC);
        buf.resize(AUDIO_FRAME_BYTES, self.clip);
        Some(MediaSample {
            data: buf.freeze(),
            duration: AUDIO_FRAME,
        })
    }
}

/// Layer bitrates in kbps, HIGH/MEDIUM/LOW
fn layer_kbps(resolution: &str) -> Option<[u32; 3]> {
    match resolution {
        "360p" => Some([460, 460, 460]),
        "720p" => Some([1800, 720, 460]),
        "1080p" => Some([4100, 720, 460]),
        "1440p" => Some([7300, 4800, 1200]),
        _ => None,
    }
}

/// Hands out media sources for one run.
///
/// Clips are assigned round-robin through a cursor owned by the catalog, so
/// separate runs in the same process do not influence each other.
#[derive(Debug)]
pub struct MediaCatalog {
    codec: Codec,
    cursor: AtomicUsize,
}

impl MediaCatalog {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Layer metadata for one rung of a resolution ladder
    pub fn video_layer(&self, resolution: &str, quality: VideoQuality) -> Result<VideoLayer, MediaError> {
        if self.codec == Codec::Opus {
            return Err(MediaError::MissingLayers {
                codec: self.codec,
                resolution: resolution.to_string(),
            });
        }

        let ladder = Resolution::lookup(resolution)
            .ok_or_else(|| MediaError::UnsupportedResolution(resolution.to_string()))?;
        let kbps = layer_kbps(resolution).ok_or_else(|| MediaError::MissingLayers {
            codec: self.codec,
            resolution: resolution.to_string(),
        })?;

        Ok(VideoLayer {
            quality,
            dimensions: ladder.dimensions(quality),
            bitrate: kbps[quality.ladder_index()] * 1000,
        })
    }

    /// Single-layer video source at the top of the ladder
    pub fn video_source(&self, resolution: &str) -> Result<Box<dyn MediaSource>, MediaError> {
        let layer = self.video_layer(resolution, VideoQuality::High)?;
        Ok(Box::new(SyntheticVideo::new(self.codec, layer, self.next_clip())))
    }

    /// One source per simulcast layer, ordered HIGH, MEDIUM, LOW
    pub fn simulcast_sources(&self, resolution: &str) -> Result<Vec<Box<dyn MediaSource>>, MediaError> {
        let clip = self.next_clip();
        VideoQuality::ALL
            .iter()
            .map(|&quality| {
                let layer = self.video_layer(resolution, quality)?;
                Ok(Box::new(SyntheticVideo::new(self.codec, layer, clip)) as Box<dyn MediaSource>)
            })
            .collect()
    }

    pub fn audio_source(&self) -> Box<dyn MediaSource> {
        Box::new(SyntheticAudio::new(self.next_clip()))
    }

    fn next_clip(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % CLIP_COUNT
    }
}
