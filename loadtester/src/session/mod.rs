//! Room sessions: the capability testers use to join rooms and move media
//!
//! `Session`/`Transport` are the seam to a real-time media service. The crate
//! ships one implementation, an in-process loopback room service.

mod loopback;
mod types;

use std::sync::Arc;

pub use loopback::{LOOPBACK_SCHEME, LoopbackOptions, LoopbackSession, LoopbackTransport};
pub use types::{
    ConnectInfo, DataReliability, KeyframeRequester, LocalTrack, RemotePublication, RemoteTrack, Session,
    SessionError, SessionEvent, TrackHandle, Transport,
};

/// Select a transport from the URL scheme
pub fn transport_for_url(url: &str, options: LoopbackOptions) -> Result<Arc<dyn Transport>, SessionError> {
    if url.starts_with(LOOPBACK_SCHEME) {
        return Ok(Arc::new(LoopbackTransport::new(options)));
    }
    Err(SessionError::UnsupportedUrl(url.to_string()))
}
