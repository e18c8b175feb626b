use thiserror::Error;

/// Errors from parsing torrent files, magnet links, or fetched metadata.
#[derive(Debug, Error)]
pub enum MetainfoError {
    /// The file is not valid bencode.
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// A required dictionary key is absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A field is present but has the wrong type or an invalid value.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    /// The file lengths do not add up to the piece geometry.
    #[error("inconsistent lengths: {0}")]
    InconsistentLengths(&'static str),

    /// Info hash is not 20 bytes / 40 hex chars / 32 base32 chars.
    #[error("invalid info hash")]
    InvalidInfoHash,

    /// Magnet URI is missing required parts or malformed.
    #[error("invalid magnet link: {0}")]
    InvalidMagnetLink(String),
}
