//! Peer exchange (ut_pex, BEP-11).
//!
//! Connected peers gossip addresses of other swarm members. The payload is
//! a bencoded dictionary whose `added`/`dropped` keys carry compact 6-byte
//! IPv4 entries (`added6`/`dropped6` the 18-byte IPv6 form), plus one flag
//! byte per added peer.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::bencode::{decode, encode, Value};

/// Capability flags attached to an added peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PexFlags {
    /// Prefers encrypted connections.
    pub encryption: bool,
    /// Is a seed.
    pub seed: bool,
}

impl PexFlags {
    pub fn from_byte(b: u8) -> Self {
        Self {
            encryption: b & 0x01 != 0,
            seed: b & 0x02 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        (self.encryption as u8) | (self.seed as u8) << 1
    }
}

/// One peer advertised over PEX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PexPeer {
    pub addr: SocketAddr,
    pub flags: PexFlags,
}

impl PexPeer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            flags: PexFlags::default(),
        }
    }
}

/// A PEX delta: peers that joined and peers that left since the last
/// message to this neighbor.
#[derive(Debug, Clone, Default)]
pub struct PexMessage {
    pub added: Vec<PexPeer>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty()
    }

    /// Encodes the bencoded ut_pex payload.
    pub fn to_wire(&self) -> Bytes {
        let mut dict = BTreeMap::new();

        let (v4_added, v6_added): (Vec<&PexPeer>, Vec<&PexPeer>) =
            self.added.iter().partition(|p| p.addr.is_ipv4());
        let (v4_dropped, v6_dropped): (Vec<&SocketAddr>, Vec<&SocketAddr>) =
            self.dropped.iter().partition(|a| a.is_ipv4());

        dict.insert(
            Bytes::from_static(b"added"),
            Value::Bytes(compact_v4(v4_added.iter().map(|p| p.addr))),
        );
        let flags: BytesMut = v4_added.iter().map(|p| p.flags.to_byte()).collect();
        dict.insert(
            Bytes::from_static(b"added.f"),
            Value::Bytes(flags.freeze()),
        );
        dict.insert(
            Bytes::from_static(b"dropped"),
            Value::Bytes(compact_v4(v4_dropped.iter().copied().copied())),
        );
        if !v6_added.is_empty() {
            dict.insert(
                Bytes::from_static(b"added6"),
                Value::Bytes(compact_v6(v6_added.iter().map(|p| p.addr))),
            );
            let flags6: BytesMut = v6_added.iter().map(|p| p.flags.to_byte()).collect();
            dict.insert(
                Bytes::from_static(b"added6.f"),
                Value::Bytes(flags6.freeze()),
            );
        }
        if !v6_dropped.is_empty() {
            dict.insert(
                Bytes::from_static(b"dropped6"),
                Value::Bytes(compact_v6(v6_dropped.iter().copied().copied())),
            );
        }

        Bytes::from(encode(&Value::Dict(dict)))
    }

    /// Decodes a received ut_pex payload; malformed compact entries are
    /// skipped rather than fatal.
    pub fn from_wire(payload: &[u8]) -> Option<Self> {
        let value = decode(payload).ok()?;
        value.as_dict()?;

        let mut message = PexMessage::new();

        let added = value.get(b"added").and_then(|v| v.as_bytes());
        let flags = value
            .get(b"added.f")
            .and_then(|v| v.as_bytes())
            .map(|b| b.as_ref())
            .unwrap_or(&[]);
        if let Some(raw) = added {
            for (i, chunk) in raw.chunks_exact(6).enumerate() {
                message.added.push(PexPeer {
                    addr: parse_v4(chunk),
                    flags: flags
                        .get(i)
                        .copied()
                        .map(PexFlags::from_byte)
                        .unwrap_or_default(),
                });
            }
        }
        if let Some(raw) = value.get(b"added6").and_then(|v| v.as_bytes()) {
            let flags6 = value
                .get(b"added6.f")
                .and_then(|v| v.as_bytes())
                .map(|b| b.as_ref())
                .unwrap_or(&[]);
            for (i, chunk) in raw.chunks_exact(18).enumerate() {
                message.added.push(PexPeer {
                    addr: parse_v6(chunk),
                    flags: flags6
                        .get(i)
                        .copied()
                        .map(PexFlags::from_byte)
                        .unwrap_or_default(),
                });
            }
        }
        if let Some(raw) = value.get(b"dropped").and_then(|v| v.as_bytes()) {
            for chunk in raw.chunks_exact(6) {
                message.dropped.push(parse_v4(chunk));
            }
        }
        if let Some(raw) = value.get(b"dropped6").and_then(|v| v.as_bytes()) {
            for chunk in raw.chunks_exact(18) {
                message.dropped.push(parse_v6(chunk));
            }
        }

        Some(message)
    }
}

fn compact_v4(addrs: impl Iterator<Item = SocketAddr>) -> Bytes {
    let mut buf = BytesMut::new();
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
        }
    }
    buf.freeze()
}

fn compact_v6(addrs: impl Iterator<Item = SocketAddr>) -> Bytes {
    let mut buf = BytesMut::new();
    for addr in addrs {
        if let SocketAddr::V6(v6) = addr {
            buf.put_slice(&v6.ip().octets());
            buf.put_u16(v6.port());
        }
    }
    buf.freeze()
}

fn parse_v4(chunk: &[u8]) -> SocketAddr {
    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
    SocketAddr::new(IpAddr::V4(ip), port)
}

fn parse_v6(chunk: &[u8]) -> SocketAddr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&chunk[..16]);
    let port = u16::from_be_bytes([chunk[16], chunk[17]]);
    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
}
