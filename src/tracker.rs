//! Tracker clients: HTTP (BEP-3 compact responses) and UDP (BEP-15).
//!
//! The engine announces through [`announce_url`], which dispatches on the
//! URL scheme; tier rotation across the announce-list lives in the engine
//! loop.

mod error;
mod http;
mod response;
mod udp;

pub use error::TrackerError;
pub use http::HttpTracker;
pub use response::{parse_compact_peers, parse_compact_peers6, AnnounceResponse, TrackerEvent};
pub use udp::UdpTracker;

use crate::metainfo::InfoHash;
use crate::peer::PeerId;

/// Byte counters reported on every announce.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Announces to one tracker URL, picking the client by scheme.
pub async fn announce_url(
    url: &str,
    info_hash: &InfoHash,
    peer_id: &PeerId,
    port: u16,
    stats: AnnounceStats,
    event: TrackerEvent,
) -> Result<AnnounceResponse, TrackerError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        let tracker = HttpTracker::new(url)?;
        tracker
            .announce(info_hash.as_bytes(), peer_id.as_bytes(), port, stats, event)
            .await
    } else if url.starts_with("udp://") {
        let mut tracker = UdpTracker::connect(url).await?;
        tracker
            .announce(info_hash.as_bytes(), peer_id.as_bytes(), port, stats, event)
            .await
    } else {
        Err(TrackerError::UnsupportedScheme(url.to_string()))
    }
}

#[cfg(test)]
mod tests;
