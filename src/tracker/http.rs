use std::time::Duration;

use reqwest::Client;

use super::error::TrackerError;
use super::response::{parse_compact_peers, parse_compact_peers6, AnnounceResponse, TrackerEvent};
use super::AnnounceStats;
use crate::bencode::decode;
use crate::constants::CLIENT_VERSION;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP(S) tracker client using compact announces.
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(CLIENT_VERSION)
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub async fn announce(
        &self,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
        port: u16,
        stats: AnnounceStats,
        event: TrackerEvent,
    ) -> Result<AnnounceResponse, TrackerError> {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url,
            percent_encode(info_hash),
            percent_encode(peer_id),
            port,
            stats.uploaded,
            stats.downloaded,
            stats.left,
        );
        if !event.as_query().is_empty() {
            url.push_str("&event=");
            url.push_str(event.as_query());
        }

        let body = self.client.get(&url).send().await?.bytes().await?;
        parse_announce_body(&body)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Parses a bencoded announce response body.
pub fn parse_announce_body(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = decode(body)?;
    if value.as_dict().is_none() {
        return Err(TrackerError::InvalidResponse("expected dict".into()));
    }

    if let Some(reason) = value.get_str(b"failure reason") {
        return Err(TrackerError::Failure(reason.to_string()));
    }

    let interval = value
        .get_int(b"interval")
        .ok_or_else(|| TrackerError::InvalidResponse("missing interval".into()))?
        as u32;

    let mut response = AnnounceResponse::new(interval);
    response.min_interval = value.get_int(b"min interval").map(|v| v as u32);
    response.complete = value.get_int(b"complete").map(|v| v as u32);
    response.incomplete = value.get_int(b"incomplete").map(|v| v as u32);

    if let Some(peers) = value.get(b"peers") {
        if let Some(compact) = peers.as_bytes() {
            response.peers = parse_compact_peers(compact);
        } else if let Some(list) = peers.as_list() {
            // Non-compact dictionary form, still seen from older trackers.
            for peer in list {
                let ip = peer.get_str(b"ip").and_then(|s| s.parse().ok());
                let port = peer.get_int(b"port").and_then(|p| u16::try_from(p).ok());
                if let (Some(ip), Some(port)) = (ip, port) {
                    response.peers.push(std::net::SocketAddr::new(ip, port));
                }
            }
        }
    }
    if let Some(peers6) = value.get(b"peers6").and_then(|v| v.as_bytes()) {
        response.peers.extend(parse_compact_peers6(peers6));
    }

    Ok(response)
}

fn percent_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(60), |mut s, &b| {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            s.push(b as char);
        } else {
            let _ = write!(s, "%{:02X}", b);
        }
        s
    })
}
