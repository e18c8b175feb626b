//! riptide - a BitTorrent client engine
//!
//! Takes a `.torrent` file or magnet link, finds peers through trackers
//! and PEX, downloads and verifies content against an untrusted swarm,
//! seeds it back, and resumes across restarts.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`metainfo`] - torrent files, magnet links, info hashes
//! - [`piece`] - piece/block scheduling, rarest-first selection, verification
//! - [`peer`] - BEP-3/9/10/11 peer wire protocol and sessions
//! - [`mse`] - MSE/PE encrypted handshake and RC4 stream obfuscation
//! - [`swarm`] - choking algorithm, peer scoring, candidate pool
//! - [`engine`] - the engine loop tying everything together
//! - [`tracker`] - BEP-3/15 HTTP and UDP tracker clients
//! - [`storage`] - sparse file I/O and re-verification
//! - [`pex`] - BEP-11 peer exchange payloads
//! - [`resume`] - persisted download state

pub mod bencode;
pub mod constants;
pub mod engine;
pub mod metainfo;
pub mod mse;
pub mod peer;
pub mod pex;
pub mod piece;
pub mod resume;
pub mod storage;
pub mod swarm;
pub mod torrent;
pub mod tracker;

pub use engine::{Engine, EngineConfig, EngineError, Progress};
pub use metainfo::{InfoHash, MagnetLink, Metainfo, TorrentInfo};
pub use peer::{Bitfield, Message, PeerId};
pub use piece::{BlockRequest, PieceMap};
pub use resume::ResumeRecord;
