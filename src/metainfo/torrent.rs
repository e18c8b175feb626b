use super::error::MetainfoError;
use super::info_hash::InfoHash;
use crate::bencode::{decode, encode, Value};
use bytes::Bytes;
use std::path::PathBuf;

/// A parsed `.torrent` file: the content description plus announce data.
///
/// # Examples
///
/// ```no_run
/// use riptide::metainfo::Metainfo;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let data = std::fs::read("example.torrent")?;
/// let metainfo = Metainfo::from_bytes(&data)?;
/// println!("{}: {} bytes", metainfo.info.name, metainfo.info.total_length);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The normalized content description.
    pub info: TorrentInfo,
    /// Primary tracker URL.
    pub announce: Option<String>,
    /// Multi-tier tracker list (BEP-12).
    pub announce_list: Vec<Vec<String>>,
}

/// The immutable content description the engine downloads against.
///
/// Invariants established at construction and never violated afterwards:
/// the file lengths sum to `total_length`, and
/// `piece_hashes.len() == ceil(total_length / piece_length)`.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// SHA-1 of the canonical bencoded info dictionary.
    pub info_hash: InfoHash,
    /// Suggested name for the file or root directory.
    pub name: String,
    /// Bytes per piece; the last piece may be shorter.
    pub piece_length: u64,
    /// Expected SHA-1 hash of each piece.
    pub piece_hashes: Vec<[u8; 20]>,
    /// Total content size in bytes.
    pub total_length: u64,
    /// Files in torrent order, with byte offsets into the piece space.
    pub files: Vec<FileSpec>,
    /// Raw bencoded info dictionary, served verbatim over ut_metadata.
    pub raw_info: Bytes,
}

/// A single file within the torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    /// Path relative to the download root.
    pub path: PathBuf,
    /// File size in bytes.
    pub length: u64,
    /// Byte offset of the file within the concatenated content.
    pub offset: u64,
}

impl Metainfo {
    /// Parses a `.torrent` file from raw bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let value = decode(data)?;
        let dict = value.as_dict().ok_or(MetainfoError::InvalidField("root"))?;

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;
        let raw_info = Bytes::from(encode(info_value));
        let info = TorrentInfo::from_info_value(info_value, raw_info)?;

        let announce = value.get_str(b"announce").map(String::from);

        let announce_list = dict
            .get(b"announce-list".as_slice())
            .and_then(|v| v.as_list())
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| {
                        tier.as_list().map(|urls| {
                            urls.iter()
                                .filter_map(|u| u.as_str().map(String::from))
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            info,
            announce,
            announce_list,
        })
    }

    /// All tracker URLs in announce order, tiers flattened, deduplicated.
    pub fn trackers(&self) -> Vec<String> {
        let mut trackers = Vec::new();
        if let Some(ref announce) = self.announce {
            trackers.push(announce.clone());
        }
        for tier in &self.announce_list {
            for url in tier {
                if !trackers.contains(url) {
                    trackers.push(url.clone());
                }
            }
        }
        trackers
    }
}

impl TorrentInfo {
    /// Builds a `TorrentInfo` from raw bencoded info bytes, as delivered by
    /// the metadata exchange. The info hash is computed from the bytes.
    pub fn from_info_bytes(raw_info: Bytes) -> Result<Self, MetainfoError> {
        let value = decode(&raw_info)?;
        Self::from_info_value(&value, raw_info)
    }

    fn from_info_value(value: &Value, raw_info: Bytes) -> Result<Self, MetainfoError> {
        let dict = value.as_dict().ok_or(MetainfoError::InvalidField("info"))?;
        let info_hash = InfoHash::of_info(&raw_info);

        let name = value
            .get_str(b"name")
            .ok_or(MetainfoError::MissingField("name"))?
            .to_string();

        let piece_length = value
            .get_int(b"piece length")
            .filter(|&l| l > 0)
            .ok_or(MetainfoError::MissingField("piece length"))? as u64;

        let pieces_bytes = dict
            .get(b"pieces".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or(MetainfoError::MissingField("pieces"))?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(MetainfoError::InvalidField("pieces"));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (files, total_length) = parse_files(value, &name)?;

        // ceil(N/L) must equal the number of piece hashes.
        let expected_pieces = total_length.div_ceil(piece_length) as usize;
        if expected_pieces != piece_hashes.len() {
            return Err(MetainfoError::InconsistentLengths(
                "piece count does not match total length",
            ));
        }

        Ok(Self {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length,
            files,
            raw_info,
        })
    }

    /// Number of pieces.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Actual length of piece `index`; only the last piece can be short.
    pub fn piece_size(&self, index: u32) -> u64 {
        let count = self.piece_count() as u64;
        if count == 0 {
            return 0;
        }
        if u64::from(index) + 1 < count {
            self.piece_length
        } else {
            self.total_length - (count - 1) * self.piece_length
        }
    }
}

fn parse_files(info: &Value, name: &str) -> Result<(Vec<FileSpec>, u64), MetainfoError> {
    if let Some(length) = info.get_int(b"length") {
        // Single-file torrent.
        let length = length as u64;
        let file = FileSpec {
            path: PathBuf::from(name),
            length,
            offset: 0,
        };
        return Ok((vec![file], length));
    }

    let file_list = info
        .get(b"files")
        .and_then(|v| v.as_list())
        .ok_or(MetainfoError::MissingField("length or files"))?;

    let mut files = Vec::with_capacity(file_list.len());
    let mut offset = 0u64;
    for entry in file_list {
        let length = entry
            .get_int(b"length")
            .ok_or(MetainfoError::MissingField("file length"))? as u64;

        let path_list = entry
            .get(b"path")
            .and_then(|v| v.as_list())
            .ok_or(MetainfoError::MissingField("file path"))?;
        let path: PathBuf = std::iter::once(name.to_string())
            .chain(
                path_list
                    .iter()
                    .filter_map(|p| p.as_str().map(String::from)),
            )
            .collect();

        files.push(FileSpec {
            path,
            length,
            offset,
        });
        offset += length;
    }

    if files.is_empty() {
        return Err(MetainfoError::InvalidField("files"));
    }
    Ok((files, offset))
}
