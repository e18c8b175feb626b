//! Metadata exchange (ut_metadata, BEP-9).
//!
//! When the engine starts from a magnet link it knows only the info hash;
//! the info dictionary itself is pulled from peers in 16KB pieces over the
//! extension protocol. [`MetadataMessage`] is the wire codec and
//! [`MetadataFetcher`] the shared download state machine that sessions
//! drive.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use super::error::PeerError;
use crate::bencode::{decode_prefix, encode, Value};
use crate::constants::{MAX_METADATA_SIZE, METADATA_PIECE_SIZE, REQUEST_TIMEOUT};
use crate::metainfo::InfoHash;
use crate::piece::PeerKey;

/// ut_metadata message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageKind {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl MetadataMessageKind {
    fn from_int(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Request),
            1 => Some(Self::Data),
            2 => Some(Self::Reject),
            _ => None,
        }
    }
}

/// One ut_metadata message: a small bencoded header, with the raw piece
/// bytes appended after the dictionary for `Data` messages.
#[derive(Debug, Clone)]
pub struct MetadataMessage {
    pub kind: MetadataMessageKind,
    pub piece: u32,
    pub total_size: Option<u32>,
    pub data: Option<Bytes>,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            kind: MetadataMessageKind::Request,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn data(piece: u32, total_size: u32, data: Bytes) -> Self {
        Self {
            kind: MetadataMessageKind::Data,
            piece,
            total_size: Some(total_size),
            data: Some(data),
        }
    }

    pub fn reject(piece: u32) -> Self {
        Self {
            kind: MetadataMessageKind::Reject,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut dict = BTreeMap::new();
        dict.insert(
            Bytes::from_static(b"msg_type"),
            Value::Int(self.kind as i64),
        );
        dict.insert(
            Bytes::from_static(b"piece"),
            Value::Int(i64::from(self.piece)),
        );
        if let Some(total) = self.total_size {
            dict.insert(
                Bytes::from_static(b"total_size"),
                Value::Int(i64::from(total)),
            );
        }

        let mut out = encode(&Value::Dict(dict));
        if let Some(ref data) = self.data {
            out.extend_from_slice(data);
        }
        Bytes::from(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (header, used) = decode_prefix(payload)?;

        let kind = header
            .get_int(b"msg_type")
            .and_then(MetadataMessageKind::from_int)
            .ok_or_else(|| PeerError::Extension("bad msg_type".into()))?;
        let piece = header
            .get_int(b"piece")
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| PeerError::Extension("bad piece".into()))?;
        let total_size = header
            .get_int(b"total_size")
            .and_then(|s| u32::try_from(s).ok());

        let data = if kind == MetadataMessageKind::Data {
            Some(Bytes::copy_from_slice(&payload[used..]))
        } else {
            None
        };

        Ok(Self {
            kind,
            piece,
            total_size,
            data,
        })
    }
}

/// Outcome of feeding one data piece to the fetcher.
#[derive(Debug)]
pub enum MetadataProgress {
    /// More pieces outstanding, or the fetcher is already done.
    Incomplete,
    /// All pieces assembled and the SHA-1 matched the info hash.
    Complete(Bytes),
    /// Assembly hashed wrong; the buffer was discarded and every peer that
    /// contributed a piece is listed for banning.
    Invalid { contributors: Vec<PeerKey> },
}

struct FetchInner {
    size: Option<usize>,
    pieces: Vec<Option<Bytes>>,
    sources: Vec<Option<PeerKey>>,
    pending: HashMap<u32, (PeerKey, Instant)>,
    complete: Option<Bytes>,
}

/// Shared download state for the info dictionary.
///
/// Armed by the first extended handshake that announces a plausible
/// `metadata_size`; after that, any session whose peer speaks ut_metadata
/// can pull requests from it and feed data back.
pub struct MetadataFetcher {
    info_hash: InfoHash,
    inner: Mutex<FetchInner>,
}

impl MetadataFetcher {
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            inner: Mutex::new(FetchInner {
                size: None,
                pieces: Vec::new(),
                sources: Vec::new(),
                pending: HashMap::new(),
                complete: None,
            }),
        }
    }

    /// Arms the fetcher with the advertised metadata size. The first
    /// plausible size wins; later announcements are ignored.
    pub fn announce_size(&self, size: usize) {
        let mut inner = self.inner.lock();
        if inner.size.is_some() || inner.complete.is_some() {
            return;
        }
        if size == 0 || size > MAX_METADATA_SIZE {
            tracing::warn!(size, "ignoring implausible metadata size");
            return;
        }
        let pieces = size.div_ceil(METADATA_PIECE_SIZE);
        inner.size = Some(size);
        inner.pieces = vec![None; pieces];
        inner.sources = vec![None; pieces];
        tracing::debug!(size, pieces, "metadata fetch armed");
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().size.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().complete.is_some()
    }

    pub fn size(&self) -> Option<usize> {
        self.inner.lock().size
    }

    /// Hands out the next metadata piece index for `peer` to request.
    /// Stale pending entries (peer vanished mid-request) are reassigned
    /// after the request timeout.
    pub fn next_request(&self, peer: PeerKey) -> Option<u32> {
        let mut inner = self.inner.lock();
        if inner.complete.is_some() {
            return None;
        }
        let count = inner.pieces.len();
        let now = Instant::now();
        for piece in 0..count as u32 {
            if inner.pieces[piece as usize].is_some() {
                continue;
            }
            match inner.pending.get(&piece) {
                Some((_, at)) if now.duration_since(*at) < REQUEST_TIMEOUT => continue,
                _ => {
                    inner.pending.insert(piece, (peer, now));
                    return Some(piece);
                }
            }
        }
        None
    }

    /// Clears a peer's pending request after a reject so another peer can
    /// pick the piece up.
    pub fn reject(&self, peer: PeerKey, piece: u32) {
        let mut inner = self.inner.lock();
        if let Some((holder, _)) = inner.pending.get(&piece) {
            if *holder == peer {
                inner.pending.remove(&piece);
            }
        }
    }

    /// Releases every pending request held by a departing peer.
    pub fn peer_gone(&self, peer: PeerKey) {
        self.inner.lock().pending.retain(|_, (p, _)| *p != peer);
    }

    /// Feeds one received metadata piece. Piece geometry is validated
    /// against the armed size; the final piece triggers verification of
    /// the whole buffer against the info hash.
    pub fn deliver(&self, peer: PeerKey, piece: u32, data: Bytes) -> MetadataProgress {
        let mut inner = self.inner.lock();
        if inner.complete.is_some() {
            return MetadataProgress::Incomplete;
        }
        let Some(size) = inner.size else {
            return MetadataProgress::Incomplete;
        };

        let count = inner.pieces.len();
        let idx = piece as usize;
        if idx >= count {
            return MetadataProgress::Incomplete;
        }
        let expected = if idx + 1 == count {
            size - (count - 1) * METADATA_PIECE_SIZE
        } else {
            METADATA_PIECE_SIZE
        };
        if data.len() != expected {
            tracing::warn!(piece, got = data.len(), expected, "bad metadata piece size");
            return MetadataProgress::Incomplete;
        }

        inner.pending.remove(&piece);
        if inner.pieces[idx].is_none() {
            inner.pieces[idx] = Some(data);
            inner.sources[idx] = Some(peer);
        }
        if inner.pieces.iter().any(|p| p.is_none()) {
            return MetadataProgress::Incomplete;
        }

        // All pieces present: the concatenation must hash to the info hash.
        let mut raw = Vec::with_capacity(size);
        for p in inner.pieces.iter().flatten() {
            raw.extend_from_slice(p);
        }
        let mut hasher = Sha1::new();
        hasher.update(&raw);
        let digest: [u8; 20] = hasher.finalize().into();

        if &digest == self.info_hash.as_bytes() {
            let raw = Bytes::from(raw);
            inner.complete = Some(raw.clone());
            tracing::debug!(size, "metadata verified");
            MetadataProgress::Complete(raw)
        } else {
            let mut contributors: Vec<PeerKey> =
                inner.sources.iter().filter_map(|s| *s).collect();
            contributors.sort_unstable();
            contributors.dedup();
            inner.pieces = vec![None; count];
            inner.sources = vec![None; count];
            inner.pending.clear();
            tracing::warn!("metadata hash mismatch, restarting fetch");
            MetadataProgress::Invalid { contributors }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr(n: u8) -> SocketAddr {
        format!("10.1.0.{}:6881", n).parse().unwrap()
    }

    #[test]
    fn test_message_roundtrip() {
        let cases = [
            MetadataMessage::request(5),
            MetadataMessage::data(2, 1000, Bytes::from_static(b"hello")),
            MetadataMessage::reject(9),
        ];
        for msg in cases {
            let decoded = MetadataMessage::decode(&msg.encode()).unwrap();
            assert_eq!(decoded.kind, msg.kind);
            assert_eq!(decoded.piece, msg.piece);
            assert_eq!(decoded.total_size, msg.total_size);
            assert_eq!(decoded.data, msg.data);
        }
    }

    #[test]
    fn test_fetch_single_piece_verifies() {
        // The 26-byte magnet bootstrap fixture.
        let raw = b"d4:name3:xyz6:lengthi1ee__"[..26].to_vec();
        let info_hash = {
            let mut hasher = Sha1::new();
            hasher.update(&raw);
            InfoHash(hasher.finalize().into())
        };

        let fetcher = MetadataFetcher::new(info_hash);
        assert!(fetcher.next_request(addr(1)).is_none(), "not armed yet");

        fetcher.announce_size(26);
        assert_eq!(fetcher.next_request(addr(1)), Some(0));

        match fetcher.deliver(addr(1), 0, Bytes::from(raw)) {
            MetadataProgress::Complete(bytes) => assert_eq!(bytes.len(), 26),
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(fetcher.is_complete());
        assert!(fetcher.next_request(addr(2)).is_none());
    }

    #[test]
    fn test_fetch_mismatch_restarts_and_names_source() {
        let fetcher = MetadataFetcher::new(InfoHash([0u8; 20]));
        fetcher.announce_size(10);

        assert_eq!(fetcher.next_request(addr(1)), Some(0));
        match fetcher.deliver(addr(1), 0, Bytes::from(vec![1u8; 10])) {
            MetadataProgress::Invalid { contributors } => {
                assert_eq!(contributors, vec![addr(1)]);
            }
            other => panic!("expected invalid, got {:?}", other),
        }

        // The fetch restarts from scratch with another peer.
        assert!(!fetcher.is_complete());
        assert_eq!(fetcher.next_request(addr(2)), Some(0));
    }

    #[test]
    fn test_reject_fails_over() {
        let fetcher = MetadataFetcher::new(InfoHash([0u8; 20]));
        fetcher.announce_size(40000);

        assert_eq!(fetcher.next_request(addr(1)), Some(0));
        assert_eq!(fetcher.next_request(addr(2)), Some(1));
        assert_eq!(fetcher.next_request(addr(3)), Some(2));
        assert!(fetcher.next_request(addr(4)).is_none(), "all pending");

        fetcher.reject(addr(2), 1);
        assert_eq!(fetcher.next_request(addr(4)), Some(1));
    }

    #[test]
    fn test_implausible_sizes_ignored() {
        let fetcher = MetadataFetcher::new(InfoHash([0u8; 20]));
        fetcher.announce_size(0);
        assert!(!fetcher.is_armed());
        fetcher.announce_size(MAX_METADATA_SIZE + 1);
        assert!(!fetcher.is_armed());
        fetcher.announce_size(100);
        assert!(fetcher.is_armed());
        // First plausible size wins.
        fetcher.announce_size(200);
        assert_eq!(fetcher.size(), Some(100));
    }
}
