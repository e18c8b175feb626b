use thiserror::Error;

/// Tracker announce failures. All of these are non-fatal to the engine;
/// peers keep arriving from other sources.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// The tracker answered with a failure reason.
    #[error("tracker failure: {0}")]
    Failure(String),

    /// Response did not follow the protocol.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// URL scheme we do not announce over.
    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid tracker url: {0}")]
    InvalidUrl(String),

    /// Every retry timed out.
    #[error("tracker timeout")]
    Timeout,
}
