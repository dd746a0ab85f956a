//! Send-timestamp trailer carried at the end of video samples and data packets
//!
//! The trailer is the publisher's wall clock in nanoseconds, little-endian, in
//! the last 8 bytes of the payload. Receivers subtract it from their own clock.
//! Clocks are not assumed to be synchronized, so the ledger keeps a sum and a
//! sample count and reports the mean.

use bytes::{BufMut, Bytes, BytesMut};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Length of the timestamp trailer in bytes
pub const TRAILER_LEN: usize = 8;

/// Samples whose send time is further than this from "now" are discarded
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(20 * 60);

/// Current wall clock in nanoseconds since the Unix epoch
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Append a trailer stamped with `sent_at` (ns since epoch)
pub fn append_trailer(buf: &mut BytesMut, sent_at: i64) {
    buf.put_u64_le(sent_at as u64);
}

/// Build a payload of `body_len` zero bytes followed by a trailer stamped now
pub fn stamped_payload(body_len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(body_len + TRAILER_LEN);
    buf.resize(body_len, 0);
    append_trailer(&mut buf, now_nanos());
    buf.freeze()
}

/// Read the trailer, if the payload is long enough to carry one
pub fn read_trailer(payload: &[u8]) -> Option<i64> {
    if payload.len() <= TRAILER_LEN {
        return None;
    }
    let tail: [u8; TRAILER_LEN] = payload[payload.len() - TRAILER_LEN..].try_into().ok()?;
    Some(u64::from_le_bytes(tail) as i64)
}

/// Validate a send timestamp against `now` and return the latency in ns.
///
/// Returns `None` when the send time is outside the skew window or the
/// latency is not positive.
pub fn validate_sample(sent_at: i64, now: i64) -> Option<u64> {
    let skew = MAX_CLOCK_SKEW.as_nanos() as i64;
    let earliest = now.saturating_sub(skew);
    let latest = now.saturating_add(skew);
    if sent_at <= earliest || sent_at >= latest {
        return None;
    }

    let latency = now - sent_at;
    if latency <= 0 {
        return None;
    }
    Some(latency as u64)
}

/// Extract and validate the trailer of `payload` relative to `now`
pub fn latency_sample(payload: &[u8], now: i64) -> Option<u64> {
    read_trailer(payload).and_then(|sent_at| validate_sample(sent_at, now))
}
