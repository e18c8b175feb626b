//! Resume records: persisted download state keyed by info hash.
//!
//! A record is a bencoded dictionary holding the bitfield of verified
//! pieces, transfer totals, and a hint list of recently good peers.
//! Unknown keys survive a load/save cycle so newer writers can extend the
//! schema without breaking older ones.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::bencode::{decode, encode, Value};
use crate::metainfo::InfoHash;

const KNOWN_KEYS: &[&[u8]] = &[
    b"infohash",
    b"piece_length",
    b"piece_count",
    b"bitfield",
    b"uploaded",
    b"downloaded",
    b"peers_hint",
];

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Snapshot of download progress, written at shutdown and after each
/// verified piece burst.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRecord {
    pub info_hash: InfoHash,
    pub piece_length: u64,
    pub piece_count: u32,
    /// Raw possession bitmap, same layout as the wire bitfield.
    pub bitfield: Bytes,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Recently good peer addresses, compact 6-byte entries.
    pub peers_hint: Vec<SocketAddr>,
    /// Keys written by other versions, carried through verbatim.
    extra: BTreeMap<Bytes, Value>,
}

impl ResumeRecord {
    pub fn new(
        info_hash: InfoHash,
        piece_length: u64,
        piece_count: u32,
        bitfield: Bytes,
        uploaded: u64,
        downloaded: u64,
        peers_hint: Vec<SocketAddr>,
    ) -> Self {
        Self {
            info_hash,
            piece_length,
            piece_count,
            bitfield,
            uploaded,
            downloaded,
            peers_hint,
            extra: BTreeMap::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut dict = self.extra.clone();
        dict.insert(
            Bytes::from_static(b"infohash"),
            Value::from(self.info_hash.as_bytes().as_slice()),
        );
        dict.insert(
            Bytes::from_static(b"piece_length"),
            Value::Int(self.piece_length as i64),
        );
        dict.insert(
            Bytes::from_static(b"piece_count"),
            Value::Int(i64::from(self.piece_count)),
        );
        dict.insert(
            Bytes::from_static(b"bitfield"),
            Value::Bytes(self.bitfield.clone()),
        );
        dict.insert(
            Bytes::from_static(b"uploaded"),
            Value::Int(self.uploaded as i64),
        );
        dict.insert(
            Bytes::from_static(b"downloaded"),
            Value::Int(self.downloaded as i64),
        );

        let mut hint = BytesMut::with_capacity(self.peers_hint.len() * 6);
        for addr in &self.peers_hint {
            if let SocketAddr::V4(v4) = addr {
                hint.put_slice(&v4.ip().octets());
                hint.put_u16(v4.port());
            }
        }
        dict.insert(
            Bytes::from_static(b"peers_hint"),
            Value::Bytes(hint.freeze()),
        );

        encode(&Value::Dict(dict))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ResumeError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or(ResumeError::MissingField("root dict"))?;

        let info_hash = value
            .get(b"infohash")
            .and_then(|v| v.as_bytes())
            .and_then(|b| InfoHash::from_slice(b).ok())
            .ok_or(ResumeError::MissingField("infohash"))?;
        let piece_length = value
            .get_int(b"piece_length")
            .ok_or(ResumeError::MissingField("piece_length"))? as u64;
        let piece_count = value
            .get_int(b"piece_count")
            .ok_or(ResumeError::MissingField("piece_count"))? as u32;
        let bitfield = value
            .get(b"bitfield")
            .and_then(|v| v.as_bytes())
            .cloned()
            .ok_or(ResumeError::MissingField("bitfield"))?;
        let uploaded = value.get_int(b"uploaded").unwrap_or(0) as u64;
        let downloaded = value.get_int(b"downloaded").unwrap_or(0) as u64;

        let peers_hint = value
            .get(b"peers_hint")
            .and_then(|v| v.as_bytes())
            .map(|raw| {
                raw.chunks_exact(6)
                    .map(|chunk| {
                        SocketAddr::from((
                            [chunk[0], chunk[1], chunk[2], chunk[3]],
                            u16::from_be_bytes([chunk[4], chunk[5]]),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let extra: BTreeMap<Bytes, Value> = dict
            .iter()
            .filter(|(key, _)| !KNOWN_KEYS.contains(&key.as_ref()))
            .map(|(key, val)| (key.clone(), val.clone()))
            .collect();

        Ok(Self {
            info_hash,
            piece_length,
            piece_count,
            bitfield,
            uploaded,
            downloaded,
            peers_hint,
            extra,
        })
    }

    pub async fn save(&self, path: &Path) -> Result<(), ResumeError> {
        // Write-then-rename so a crash never leaves a torn record.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, self.to_bytes()).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Option<Self>, ResumeError> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(Self::from_bytes(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// True when bit `piece` is set in the stored bitfield.
    pub fn has_piece(&self, piece: u32) -> bool {
        let idx = piece as usize;
        self.bitfield
            .get(idx / 8)
            .map(|byte| byte >> (7 - idx % 8) & 1 == 1)
            .unwrap_or(false)
    }
}
