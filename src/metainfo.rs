//! Torrent metainfo: `.torrent` parsing, magnet links, info hashes.
//!
//! The normalized output of this module is [`TorrentInfo`], the immutable
//! content description the download engine runs against. A `.torrent` file
//! yields it immediately; a magnet link yields only an [`InfoHash`] until
//! the info dictionary has been fetched from peers.

mod error;
mod info_hash;
mod magnet;
mod torrent;

pub use error::MetainfoError;
pub use info_hash::InfoHash;
pub use magnet::MagnetLink;
pub use torrent::{FileSpec, Metainfo, TorrentInfo};

#[cfg(test)]
mod tests;
