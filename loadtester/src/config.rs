//! Load test configuration
//!
//! Raw parameters come from defaults, the environment and the command line.
//! `TestConfig::from_params` normalizes and validates them once, before any
//! tester is created.

use rand::Rng;
use rand::distr::Alphanumeric;
use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::media::{Codec, Resolution};
use crate::stats::latency::TRAILER_LEN;

pub const DEFAULT_ROOM: &str = "load-test";
pub const DEFAULT_URL: &str = "loopback://local";
pub const DEFAULT_NUM_PER_SECOND: f64 = 5.0;
pub const MAX_NUM_PER_SECOND: f64 = 10.0;
pub const DEFAULT_DATA_PACKET_BYTES: usize = 1024;
pub const DEFAULT_DATA_BITRATE_KBPS: u64 = 1024;
pub const DEFAULT_SPEAKER_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SPEAKING_DURATION: Duration = Duration::from_secs(2);

/// Data packets may not be sent more often than this
pub const MIN_DATA_INTERVAL: Duration = Duration::from_millis(1);

const IDENTITY_PREFIX_LEN: usize = 5;

/// Invalid load test parameters
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot have zero publishers")]
    NoPublishers,

    #[error("Cannot have remote publishers and local publishers")]
    RemoteAndLocalPublishers,

    #[error("Invalid {what} range: {start}..={end}")]
    InvalidRange { what: &'static str, start: usize, end: usize },

    #[error("Unsupported resolution: {0}")]
    UnsupportedResolution(String),

    #[error("Unsupported video codec: {0}")]
    UnsupportedCodec(String),

    #[error("Invalid join rate {0}: must be positive")]
    InvalidJoinRate(f64),

    #[error("Data packet of {bytes} bytes cannot carry the {len}-byte timestamp trailer", len = TRAILER_LEN)]
    DataPacketTooSmall { bytes: usize },

    #[error("Packet size too small for bitrate: one packet every {interval:?}, at most 1000 packets per second")]
    DataRateTooHigh { interval: Duration },

    #[error("Data bitrate of {kbps} kbps is out of range")]
    InvalidBitrate { kbps: u64 },

    #[error("Invalid duration '{0}': expected forms like 30s, 2m, 1h30m or 500ms")]
    InvalidDuration(String),
}

/// Where and how testers connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            api_key: String::new(),
            api_secret: String::new(),
        }
    }
}

impl ConnectionConfig {
    /// Load connection settings from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("ROOMLOAD_URL")
            && !url.is_empty()
        {
            config.url = url;
        }
        if let Ok(key) = env::var("ROOMLOAD_API_KEY") {
            config.api_key = key;
        }
        if let Ok(secret) = env::var("ROOMLOAD_API_SECRET") {
            config.api_secret = secret;
        }

        config
    }
}

/// Raw, unvalidated load test parameters
#[derive(Debug, Clone, PartialEq)]
pub struct LoadTestParams {
    pub room: String,
    /// Random when unset
    pub identity_prefix: Option<String>,
    /// Zero runs until canceled
    pub duration: Duration,

    pub video_publishers: usize,
    pub audio_publishers: usize,
    /// First sequential room id for local publishers
    pub start_room_number: usize,
    /// When set, overrides `video_publishers` with the size of the range
    pub end_room_number: Option<usize>,
    pub remote_publishers: usize,
    pub start_remote_room_number: usize,
    pub end_remote_room_number: Option<usize>,

    pub subscribers: usize,
    pub data_publishers: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,

    pub resolutions: Vec<String>,
    pub codec: String,
    pub num_per_second: f64,
    pub simulcast: bool,
    pub same_room: bool,
    pub with_audio: bool,
    pub simulate_speakers: bool,
    pub speaker_interval: Duration,
    pub speaking_duration: Duration,

    pub data_packet_bytes: usize,
    pub data_bitrate_kbps: u64,

    pub connection: ConnectionConfig,
}

impl Default for LoadTestParams {
    fn default() -> Self {
        Self {
            room: DEFAULT_ROOM.to_string(),
            identity_prefix: None,
            duration: Duration::ZERO,
            video_publishers: 0,
            audio_publishers: 0,
            start_room_number: 1,
            end_room_number: None,
            remote_publishers: 0,
            start_remote_room_number: 1,
            end_remote_room_number: None,
            subscribers: 0,
            data_publishers: 0,
            high: 0,
            medium: 0,
            low: 0,
            resolutions: Vec::new(),
            codec: String::new(),
            num_per_second: DEFAULT_NUM_PER_SECOND,
            simulcast: true,
            same_room: false,
            with_audio: false,
            simulate_speakers: false,
            speaker_interval: DEFAULT_SPEAKER_INTERVAL,
            speaking_duration: DEFAULT_SPEAKING_DURATION,
            data_packet_bytes: DEFAULT_DATA_PACKET_BYTES,
            data_bitrate_kbps: DEFAULT_DATA_BITRATE_KBPS,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Subscriber counts requested per quality tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierQuotas {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

/// Validated, immutable parameters for one run
#[derive(Debug, Clone)]
pub struct TestConfig {
    pub room: String,
    pub identity_prefix: String,
    /// `None` runs until canceled
    pub duration: Option<Duration>,

    pub video_publishers: usize,
    pub audio_publishers: usize,
    pub remote_publishers: usize,
    /// First room id: local publishers' start, or the remote range start
    pub start_room_number: usize,

    pub subscribers: usize,
    pub data_publishers: usize,
    pub quotas: TierQuotas,

    pub resolutions: Vec<String>,
    pub codec: Codec,
    pub num_per_second: f64,
    pub simulcast: bool,
    pub same_room: bool,
    pub with_audio: bool,
    pub simulate_speakers: bool,
    pub speaker_interval: Duration,
    pub speaking_duration: Duration,

    pub data_packet_bytes: usize,
    pub data_bitrate_bps: u64,

    pub connection: ConnectionConfig,
}

impl TestConfig {
    /// Normalize raw parameters and reject invalid combinations
    pub fn from_params(params: LoadTestParams) -> Result<Self, ConfigError> {
        let room = if params.room.trim().is_empty() {
            DEFAULT_ROOM.to_string()
        } else {
            params.room.trim().to_string()
        };

        let identity_prefix = match params.identity_prefix {
            Some(prefix) if !prefix.is_empty() => prefix,
            _ => random_prefix(),
        };

        let start_room_number = params.start_room_number.max(1);
        let video_publishers = match params.end_room_number {
            Some(end) => range_len("publisher room", start_room_number, end)?,
            None => params.video_publishers,
        };
        let start_remote_room_number = params.start_remote_room_number.max(1);
        let remote_publishers = match params.end_remote_room_number {
            Some(end) => range_len("remote room", start_remote_room_number, end)?,
            None => params.remote_publishers,
        };

        let local_publishers = video_publishers + params.audio_publishers;
        if remote_publishers == 0 && local_publishers == 0 {
            return Err(ConfigError::NoPublishers);
        }
        if remote_publishers > 0 && local_publishers > 0 {
            return Err(ConfigError::RemoteAndLocalPublishers);
        }

        let num_per_second = if params.num_per_second == 0.0 {
            DEFAULT_NUM_PER_SECOND
        } else if params.num_per_second.is_nan() || params.num_per_second < 0.0 {
            return Err(ConfigError::InvalidJoinRate(params.num_per_second));
        } else {
            params.num_per_second.min(MAX_NUM_PER_SECOND)
        };

        let resolutions = normalize_resolutions(&params.resolutions)?;
        let codec: Codec = params
            .codec
            .parse()
            .map_err(|_| ConfigError::UnsupportedCodec(params.codec.clone()))?;

        let data_packet_bytes = match params.data_packet_bytes {
            0 => DEFAULT_DATA_PACKET_BYTES,
            n => n,
        };
        let data_bitrate_kbps = match params.data_bitrate_kbps {
            0 => DEFAULT_DATA_BITRATE_KBPS,
            n => n,
        };
        let data_bitrate_bps = data_bitrate_kbps
            .checked_mul(1024)
            .ok_or(ConfigError::InvalidBitrate {
                kbps: data_bitrate_kbps,
            })?;
        if data_packet_bytes <= TRAILER_LEN {
            return Err(ConfigError::DataPacketTooSmall {
                bytes: data_packet_bytes,
            });
        }
        let interval = data_send_interval(data_packet_bytes, data_bitrate_bps);
        if interval < MIN_DATA_INTERVAL {
            return Err(ConfigError::DataRateTooHigh { interval });
        }

        Ok(Self {
            room,
            identity_prefix,
            duration: (!params.duration.is_zero()).then_some(params.duration),
            video_publishers,
            audio_publishers: params.audio_publishers,
            remote_publishers,
            start_room_number: if remote_publishers > 0 {
                start_remote_room_number
            } else {
                start_room_number
            },
            subscribers: params.subscribers,
            data_publishers: params.data_publishers.min(params.subscribers),
            quotas: TierQuotas {
                high: params.high,
                medium: params.medium,
                low: params.low,
            },
            resolutions,
            codec,
            num_per_second,
            simulcast: params.simulcast,
            same_room: params.same_room,
            with_audio: params.with_audio,
            simulate_speakers: params.simulate_speakers,
            speaker_interval: params.speaker_interval,
            speaking_duration: params.speaking_duration,
            data_packet_bytes,
            data_bitrate_bps,
            connection: params.connection,
        })
    }

    pub fn is_remote(&self) -> bool {
        self.remote_publishers > 0
    }

    pub fn data_send_interval(&self) -> Duration {
        data_send_interval(self.data_packet_bytes, self.data_bitrate_bps)
    }
}

/// Time between data packets of `packet_bytes` at `bitrate_bps`
pub fn data_send_interval(packet_bytes: usize, bitrate_bps: u64) -> Duration {
    if bitrate_bps == 0 {
        return Duration::MAX;
    }
    let nanos = packet_bytes as u128 * 8 * 1_000_000_000 / u128::from(bitrate_bps);
    Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64)
}

fn range_len(what: &'static str, start: usize, end: usize) -> Result<usize, ConfigError> {
    if end < start {
        return Err(ConfigError::InvalidRange { what, start, end });
    }
    Ok(end - start + 1)
}

/// Accepts space- or comma-separated lists in each entry
fn normalize_resolutions(raw: &[String]) -> Result<Vec<String>, ConfigError> {
    raw.iter()
        .flat_map(|entry| entry.split(|c: char| c.is_whitespace() || c == ','))
        .filter(|name| !name.is_empty())
        .map(|name| {
            Resolution::lookup(name)
                .map(|r| r.name.to_string())
                .ok_or_else(|| ConfigError::UnsupportedResolution(name.to_string()))
        })
        .collect()
}

fn random_prefix() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(IDENTITY_PREFIX_LEN)
        .map(char::from)
        .collect()
}

/// Parse durations such as `30s`, `2m`, `1h30m` or `500ms`. A bare number is
/// seconds; `0` means "until canceled".
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let text = input.trim();
    if text.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Some(Duration::from_millis(value)),
            "s" => Some(Duration::from_secs(value)),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "h" => value.checked_mul(60 * 60).map(Duration::from_secs),
            _ => return Err(invalid()),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(invalid)?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}
