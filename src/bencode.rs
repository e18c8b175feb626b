//! Bencode encoding and decoding (BEP-3).
//!
//! Bencode is the serialization format used by torrent files, tracker
//! responses, and the extension protocol. Dictionaries keep their keys in
//! sorted byte order, so `encode(decode(x)) == x` for any canonically
//! encoded input.

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_prefix};
pub use encode::{encode, encode_into};
pub use error::BencodeError;
pub use value::Value;

#[cfg(test)]
mod tests;
