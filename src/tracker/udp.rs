use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng as _;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceResponse, TrackerEvent};
use super::AnnounceStats;

const PROTOCOL_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Retry schedule from BEP-15: 15 * 2^n seconds, n capped at 8. We stop
/// retrying well before the cap; a tracker silent for minutes is dead to
/// this announce round.
const RETRY_BASE: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 4;

/// UDP tracker client (BEP-15).
pub struct UdpTracker {
    socket: UdpSocket,
    connection_id: Option<u64>,
}

impl UdpTracker {
    /// Resolves the URL and completes the connect exchange.
    pub async fn connect(url: &str) -> Result<Self, TrackerError> {
        let addr = parse_udp_url(url)?;
        let socket = UdpSocket::bind(match addr {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        })
        .await?;
        socket.connect(addr).await?;

        let mut tracker = Self {
            socket,
            connection_id: None,
        };
        tracker.exchange_connect().await?;
        Ok(tracker)
    }

    async fn exchange_connect(&mut self) -> Result<(), TrackerError> {
        let transaction: u32 = rand::rng().random();

        let mut request = Vec::with_capacity(16);
        request.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        request.extend_from_slice(&transaction.to_be_bytes());

        let response = self.send_with_retry(&request, 16).await?;
        let action = read_u32(&response, 0);
        let tid = read_u32(&response, 4);
        if action != ACTION_CONNECT || tid != transaction {
            return Err(TrackerError::InvalidResponse("connect mismatch".into()));
        }
        self.connection_id = Some(u64::from_be_bytes(
            response[8..16].try_into().expect("sized above"),
        ));
        Ok(())
    }

    pub async fn announce(
        &mut self,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
        port: u16,
        stats: AnnounceStats,
        event: TrackerEvent,
    ) -> Result<AnnounceResponse, TrackerError> {
        let connection_id = self
            .connection_id
            .ok_or_else(|| TrackerError::InvalidResponse("not connected".into()))?;
        let transaction: u32 = rand::rng().random();
        let key: u32 = rand::rng().random();

        let mut request = Vec::with_capacity(98);
        request.extend_from_slice(&connection_id.to_be_bytes());
        request.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        request.extend_from_slice(&transaction.to_be_bytes());
        request.extend_from_slice(info_hash);
        request.extend_from_slice(peer_id);
        request.extend_from_slice(&stats.downloaded.to_be_bytes());
        request.extend_from_slice(&stats.left.to_be_bytes());
        request.extend_from_slice(&stats.uploaded.to_be_bytes());
        request.extend_from_slice(&event.as_udp().to_be_bytes());
        request.extend_from_slice(&0u32.to_be_bytes()); // IP: tracker derives
        request.extend_from_slice(&key.to_be_bytes());
        request.extend_from_slice(&(-1i32).to_be_bytes()); // num_want default
        request.extend_from_slice(&port.to_be_bytes());

        let response = self.send_with_retry(&request, 20).await?;
        let action = read_u32(&response, 0);
        let tid = read_u32(&response, 4);
        if action == ACTION_ERROR {
            return Err(TrackerError::Failure(
                String::from_utf8_lossy(&response[8..]).to_string(),
            ));
        }
        if action != ACTION_ANNOUNCE || tid != transaction {
            return Err(TrackerError::InvalidResponse("announce mismatch".into()));
        }

        let mut result = AnnounceResponse::new(read_u32(&response, 8));
        result.incomplete = Some(read_u32(&response, 12));
        result.complete = Some(read_u32(&response, 16));
        result.peers = parse_compact_peers(&response[20..]);
        Ok(result)
    }

    async fn send_with_retry(
        &self,
        request: &[u8],
        min_len: usize,
    ) -> Result<Vec<u8>, TrackerError> {
        let mut buf = vec![0u8; 4096];
        for attempt in 0..MAX_RETRIES {
            self.socket.send(request).await?;
            let wait = RETRY_BASE * (1 << attempt);
            match timeout(wait, self.socket.recv(&mut buf)).await {
                Ok(Ok(n)) if n >= min_len => return Ok(buf[..n].to_vec()),
                Ok(Ok(_)) => {
                    return Err(TrackerError::InvalidResponse("response too short".into()))
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => continue,
            }
        }
        Err(TrackerError::Timeout)
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(buf[at..at + 4].try_into().expect("bounds checked by caller"))
}

fn parse_udp_url(url: &str) -> Result<SocketAddr, TrackerError> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    // Try a literal address first, then resolve a hostname.
    if let Ok(addr) = authority.parse() {
        return Ok(addr);
    }
    std::net::ToSocketAddrs::to_socket_addrs(&authority)
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))
}
