//! Population planning: quality tiers, rooms and tester slots
//!
//! Planning is pure. The orchestrator turns a `PopulationPlan` into testers.

use crate::config::{TestConfig, TierQuotas};
use crate::media::{DEFAULT_RESOLUTION, VideoQuality};

/// Subscriber counts per quality tier. Always sums to the subscriber count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierSplit {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl TierSplit {
    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }

    /// Tier of the `index`-th subscriber in a cohort: HIGH first, then
    /// MEDIUM, then LOW
    pub fn tier_for(&self, index: usize) -> VideoQuality {
        if index < self.high {
            VideoQuality::High
        } else if index < self.high + self.medium {
            VideoQuality::Medium
        } else if index < self.total() {
            VideoQuality::Low
        } else {
            VideoQuality::High
        }
    }
}

/// Distribute `subscribers` across quality tiers.
///
/// The first matching rule wins:
/// 1. without simulcast everyone gets HIGH
/// 2. a HIGH quota above the subscriber count is clamped
/// 3. no quotas at all means everyone gets HIGH
/// 4. HIGH + MEDIUM above the count shrinks MEDIUM
/// 5. a total above the count shrinks LOW
/// 6. a total below the count grows HIGH
pub fn split_quality_tiers(quotas: TierQuotas, subscribers: usize, simulcast: bool) -> TierSplit {
    let TierQuotas {
        mut high,
        mut medium,
        mut low,
    } = quotas;

    if !simulcast {
        return TierSplit {
            high: subscribers,
            medium: 0,
            low: 0,
        };
    }

    if high > subscribers {
        high = subscribers;
        medium = 0;
        low = 0;
    } else if high == 0 && medium == 0 && low == 0 {
        high = subscribers;
    } else if high + medium > subscribers {
        medium = subscribers - high;
        low = 0;
    } else if high + medium + low > subscribers {
        low = subscribers - high - medium;
    } else if high + medium + low < subscribers {
        high += subscribers - high - medium - low;
    }

    TierSplit { high, medium, low }
}

/// One room subscribers will join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRoom {
    pub name: String,
    pub room_id: usize,
    pub resolution: String,
}

/// What a publisher slot publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherMedia {
    /// Video (simulcast or single layer), plus audio when `with_audio`
    Video { with_audio: bool },
    AudioOnly,
}

impl PublisherMedia {
    pub fn track_count(&self) -> usize {
        match self {
            PublisherMedia::Video { with_audio } => 1 + usize::from(*with_audio),
            PublisherMedia::AudioOnly => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherSlot {
    /// `Pub {room_id}`
    pub name: String,
    pub identity: String,
    pub room: String,
    pub room_id: usize,
    pub sequence: usize,
    pub resolution: String,
    pub media: PublisherMedia,
    /// Index of the cohort that subscribes to this publisher
    pub cohort: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberSlot {
    /// `Sub {sequence} in {room}`
    pub name: String,
    pub identity: String,
    pub room: String,
    pub sequence: usize,
    pub quality: VideoQuality,
    pub resolution: String,
    pub expected_tracks: usize,
}

/// All subscribers of one planned room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cohort {
    pub room: PlannedRoom,
    pub slots: Vec<SubscriberSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopulationPlan {
    pub split: TierSplit,
    pub publishers: Vec<PublisherSlot>,
    pub cohorts: Vec<Cohort>,
}

impl PopulationPlan {
    pub fn subscriber_count(&self) -> usize {
        self.cohorts.iter().map(|c| c.slots.len()).sum()
    }
}

/// Pad the configured resolutions with the default up to `count` entries
pub fn resolutions_for(configured: &[String], count: usize) -> Vec<String> {
    let mut resolutions = configured.to_vec();
    while resolutions.len() < count {
        resolutions.push(DEFAULT_RESOLUTION.to_string());
    }
    resolutions
}

/// Lay out rooms, publishers and subscriber cohorts for a run
pub fn plan_population(config: &TestConfig) -> PopulationPlan {
    let split = split_quality_tiers(config.quotas, config.subscribers, config.simulcast);

    let mut media: Vec<PublisherMedia> = Vec::new();
    if !config.is_remote() {
        media.extend(
            std::iter::repeat_n(
                PublisherMedia::Video {
                    with_audio: config.with_audio,
                },
                config.video_publishers,
            )
            .chain(std::iter::repeat_n(PublisherMedia::AudioOnly, config.audio_publishers)),
        );
    }
    let room_count = if config.is_remote() {
        config.remote_publishers
    } else {
        media.len()
    };
    let resolutions = resolutions_for(&config.resolutions, room_count);

    let mut rooms: Vec<(PlannedRoom, usize)> = Vec::new();
    let mut publishers = Vec::with_capacity(media.len());

    for i in 0..room_count {
        let room_id = config.start_room_number + i;
        let room = if config.same_room {
            config.room.clone()
        } else {
            format!("{}_{}", config.room, room_id)
        };
        let resolution = resolutions[i].clone();
        // Remote publishers are assumed to publish a single track each
        let tracks = media.get(i).map(|m| m.track_count()).unwrap_or(1);

        if config.same_room && !rooms.is_empty() {
            rooms[0].1 += tracks;
        } else {
            rooms.push((
                PlannedRoom {
                    name: room.clone(),
                    room_id,
                    resolution: resolution.clone(),
                },
                tracks,
            ));
        }

        if let Some(&kind) = media.get(i) {
            publishers.push(PublisherSlot {
                name: format!("Pub {}", room_id),
                identity: format!("{}_pub{}_{}", config.identity_prefix, room, i),
                room,
                room_id,
                sequence: i,
                resolution,
                media: kind,
                cohort: rooms.len() - 1,
            });
        }
    }

    let cohorts = rooms
        .into_iter()
        .map(|(room, expected_tracks)| {
            let slots = (0..config.subscribers)
                .map(|j| SubscriberSlot {
                    name: format!("Sub {} in {}", j, room.name),
                    identity: format!("{}_sub{}_{}", config.identity_prefix, room.name, j),
                    room: room.name.clone(),
                    sequence: j,
                    quality: split.tier_for(j),
                    resolution: room.resolution.clone(),
                    expected_tracks,
                })
                .collect();
            Cohort { room, slots }
        })
        .collect();

    PopulationPlan {
        split,
        publishers,
        cohorts,
    }
}
