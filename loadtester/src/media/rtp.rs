//! Minimal RTP framing for synthetic media
//!
//! Publishers split encoded samples into MTU-sized packets with the codec's
//! payload framing (H.264 FU-A, VP8 payload descriptor, Opus as-is).
//! Subscribers feed received packets through a `SampleBuilder`, which reorders
//! them, reassembles samples and reports the packets it had to give up on.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::time::Duration;

use super::types::Codec;

/// Maximum payload size per packet
pub const DEFAULT_MTU: usize = 1200;

/// Packets the builder waits for a missing sequence number before giving up
pub const DEFAULT_MAX_LATE: u16 = 100;

const H264_NAL_TYPE_MASK: u8 = 0x1F;
const H264_STAP_A: u8 = 24;
const H264_FU_A: u8 = 28;
const H264_FU_START: u8 = 0x80;
const H264_FU_END: u8 = 0x40;
const VP8_START_OF_PARTITION: u8 = 0x10;
const VP8_PARTITION_ID_MASK: u8 = 0x07;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub marker: bool,
    pub payload: Bytes,
}

/// Splits samples of one codec into RTP packets
#[derive(Debug)]
pub struct Packetizer {
    codec: Codec,
    ssrc: u32,
    mtu: usize,
    sequence_number: u16,
    timestamp: u32,
}

impl Packetizer {
    pub fn new(codec: Codec, ssrc: u32, mtu: usize) -> Self {
        Self {
            codec,
            ssrc,
            mtu: mtu.max(16),
            sequence_number: 0,
            timestamp: 0,
        }
    }

    pub fn packetize(&mut self, sample: &Bytes, duration: Duration) -> Vec<RtpPacket> {
        let payloads = match self.codec {
            Codec::H264 => self.h264_payloads(sample),
            Codec::Vp8 => self.vp8_payloads(sample),
            Codec::Opus => vec![sample.clone()],
        };

        let last = payloads.len().saturating_sub(1);
        let packets = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let packet = RtpPacket {
                    sequence_number: self.sequence_number,
                    timestamp: self.timestamp,
                    ssrc: self.ssrc,
                    marker: i == last && self.codec != Codec::Opus,
                    payload,
                };
                self.sequence_number = self.sequence_number.wrapping_add(1);
                packet
            })
            .collect();

        let ticks = duration.as_nanos() * u128::from(self.codec.clock_rate()) / 1_000_000_000;
        self.timestamp = self.timestamp.wrapping_add(ticks as u32);
        packets
    }

    fn h264_payloads(&self, nal: &Bytes) -> Vec<Bytes> {
        if nal.len() <= self.mtu {
            return vec![nal.clone()];
        }

        let header = nal[0];
        let indicator = (header & 0xE0) | H264_FU_A;
        let nal_type = header & H264_NAL_TYPE_MASK;
        let body = nal.slice(1..);
        let chunk_len = self.mtu - 2;
        let chunks = body.len().div_ceil(chunk_len);

        (0..chunks)
            .map(|i| {
                let start = i * chunk_len;
                let end = (start + chunk_len).min(body.len());
                let mut fu_header = nal_type;
                if i == 0 {
                    fu_header |= H264_FU_START;
                }
                if i == chunks - 1 {
                    fu_header |= H264_FU_END;
                }

                let mut buf = BytesMut::with_capacity(end - start + 2);
                buf.put_u8(indicator);
                buf.put_u8(fu_header);
                buf.put_slice(&body[start..end]);
                buf.freeze()
            })
            .collect()
    }

    fn vp8_payloads(&self, frame: &Bytes) -> Vec<Bytes> {
        let chunk_len = self.mtu - 1;
        frame
            .chunks(chunk_len)
            .enumerate()
            .map(|(i, chunk)| {
                let mut buf = BytesMut::with_capacity(chunk.len() + 1);
                buf.put_u8(if i == 0 { VP8_START_OF_PARTITION } else { 0 });
                buf.put_slice(chunk);
                buf.freeze()
            })
            .collect()
    }
}

/// Codec-aware sample boundary detection
#[derive(Debug, Clone, Copy)]
pub struct Depacketizer {
    codec: Codec,
}

impl Depacketizer {
    pub fn new(codec: Codec) -> Self {
        Self { codec }
    }

    /// Whether this packet can start a sample
    pub fn is_partition_head(&self, payload: &[u8]) -> bool {
        match self.codec {
            Codec::H264 => match payload.first().map(|b| b & H264_NAL_TYPE_MASK) {
                Some(1..=23) | Some(H264_STAP_A) => true,
                Some(H264_FU_A) => payload.get(1).is_some_and(|b| b & H264_FU_START != 0),
                _ => false,
            },
            Codec::Vp8 => payload.first().is_some_and(|b| {
                b & VP8_START_OF_PARTITION != 0 && b & VP8_PARTITION_ID_MASK == 0
            }),
            Codec::Opus => true,
        }
    }

    /// Whether this packet ends a sample
    pub fn is_partition_tail(&self, marker: bool, _payload: &[u8]) -> bool {
        match self.codec {
            Codec::H264 | Codec::Vp8 => marker,
            Codec::Opus => true,
        }
    }
}

/// One reassembled sample, with the packets it was built from
#[derive(Debug, Clone)]
pub struct Sample {
    pub packets: Vec<RtpPacket>,
}

/// Reorders packets by sequence number and reassembles complete samples.
///
/// A missing sequence number is waited for until the newest buffered packet
/// is `max_late` packets ahead of it. The builder then skips the gap and
/// counts the missing packets, plus any partial sample it discards, as
/// dropped.
#[derive(Debug)]
pub struct SampleBuilder {
    depacketizer: Depacketizer,
    max_late: u64,
    buffer: BTreeMap<u64, RtpPacket>,
    /// Extended sequence number of the next packet to consume
    next: Option<u64>,
    highest: Option<u64>,
    pending: Vec<RtpPacket>,
    dropped: u64,
}

impl SampleBuilder {
    pub fn new(codec: Codec, max_late: u16) -> Self {
        Self {
            depacketizer: Depacketizer::new(codec),
            max_late: u64::from(max_late.max(1)),
            buffer: BTreeMap::new(),
            next: None,
            highest: None,
            pending: Vec::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, packet: RtpPacket) {
        let ext = self.extend(packet.sequence_number);
        if let Some(next) = self.next
            && ext < next
        {
            // Too late, or a duplicate of something already consumed
            return;
        }
        self.buffer.insert(ext, packet);
    }

    /// Pop every sample that is complete
    pub fn pop(&mut self) -> Vec<Sample> {
        let mut samples = Vec::new();

        loop {
            let next = match self.next {
                Some(next) => next,
                None => match self.first_head() {
                    Some(first) => first,
                    None => break,
                },
            };
            self.next = Some(next);

            if let Some(packet) = self.buffer.remove(&next) {
                self.next = Some(next + 1);

                if self.pending.is_empty() && !self.depacketizer.is_partition_head(&packet.payload) {
                    // Middle of a sample whose head is gone
                    self.dropped += 1;
                    continue;
                }

                let tail = self
                    .depacketizer
                    .is_partition_tail(packet.marker, &packet.payload);
                self.pending.push(packet);
                if tail {
                    samples.push(Sample {
                        packets: std::mem::take(&mut self.pending),
                    });
                }
                continue;
            }

            let (Some(&first), Some(&newest)) =
                (self.buffer.keys().next(), self.buffer.keys().next_back())
            else {
                break;
            };
            if newest - next < self.max_late {
                break;
            }

            self.dropped += (first - next) + self.pending.len() as u64;
            self.pending.clear();
            self.next = Some(first);
        }

        samples
    }

    /// Where to start consuming a fresh stream: the first buffered packet once
    /// it is a sample head, or once the reorder window has passed
    fn first_head(&self) -> Option<u64> {
        let (&first, packet) = self.buffer.first_key_value()?;
        let newest = *self.buffer.keys().next_back()?;
        if self.depacketizer.is_partition_head(&packet.payload) || newest - first >= self.max_late {
            Some(first)
        } else {
            None
        }
    }

    /// Packets given up on since the last call
    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }

    /// Map a 16-bit sequence number onto a monotonic 64-bit counter
    fn extend(&mut self, seq: u16) -> u64 {
        const CYCLE: u64 = 1 << 16;

        let Some(highest) = self.highest else {
            // Start one cycle in so early reordering cannot underflow
            let ext = CYCLE + u64::from(seq);
            self.highest = Some(ext);
            return ext;
        };

        let base = highest & !(CYCLE - 1);
        let candidates = [base.saturating_sub(CYCLE), base, base + CYCLE];
        let ext = candidates
            .into_iter()
            .map(|b| b + u64::from(seq))
            .min_by_key(|ext| ext.abs_diff(highest))
            .unwrap_or(base + u64::from(seq));

        if ext > highest {
            self.highest = Some(ext);
        }
        ext
    }
}
