use thiserror::Error;

/// Disk layer failures. I/O errors during a verified-piece commit are
/// fatal to the engine; everything else is recoverable.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Piece index beyond the torrent.
    #[error("invalid piece index {0}")]
    InvalidPiece(u32),

    /// Block range does not fit inside its piece.
    #[error("invalid block range in piece {piece}: offset {offset} length {length}")]
    InvalidBlock { piece: u32, offset: u32, length: u32 },

    /// A file path tries to escape the download root.
    #[error("path escapes download root: {0}")]
    PathTraversal(String),
}
