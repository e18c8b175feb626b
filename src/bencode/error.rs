use thiserror::Error;

/// Errors produced by the bencode decoder.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    /// Input ended in the middle of a value.
    #[error("truncated input")]
    Truncated,

    /// Integer body is empty, has leading zeros, or overflows i64.
    #[error("malformed integer")]
    BadInteger,

    /// Byte-string length prefix is not a valid number.
    #[error("malformed string length")]
    BadLength,

    /// A byte that cannot start any bencode value.
    #[error("unexpected byte 0x{0:02x}")]
    UnexpectedByte(u8),

    /// Dictionary key that is not a byte string.
    #[error("dictionary key is not a string")]
    NonStringKey,

    /// Bytes remain after a complete top-level value.
    #[error("trailing data after value")]
    TrailingData,

    /// Nesting beyond the depth limit.
    #[error("nesting too deep")]
    TooDeep,
}
