use thiserror::Error;

/// Errors raised on the peer wire.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake bytes did not parse: wrong pstrlen or protocol string.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The remote answered for a different torrent.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// The remote is ourselves.
    #[error("connected to self")]
    SelfConnection,

    /// A framed message violated the protocol grammar.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The remote closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// A read, write, or handshake deadline expired.
    #[error("timeout")]
    Timeout,

    /// Extension-protocol payload could not be handled.
    #[error("extension error: {0}")]
    Extension(String),

    /// Encrypted handshake failed.
    #[error("encryption handshake: {0}")]
    Encryption(#[from] crate::mse::MseError),

    /// Bencode inside an extension message was malformed.
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}
