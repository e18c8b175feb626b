//! The per-torrent runtime: content description, piece scheduler, and
//! storage, bundled once metadata is known.
//!
//! A magnet-bootstrapped engine starts with the shared slot empty; the
//! moment the info dictionary is fetched and verified, the engine fills
//! it and every running session picks it up on its next housekeeping
//! tick.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::metainfo::TorrentInfo;
use crate::piece::PieceMap;
use crate::storage::{FileEntry, StorageError, TorrentStorage};

/// Everything a session needs once the torrent's content is described.
pub struct TorrentRuntime {
    pub info: TorrentInfo,
    pub pieces: PieceMap,
    pub storage: TorrentStorage,
}

impl TorrentRuntime {
    /// Builds the runtime under `root`, wiring the piece map and storage
    /// to the same geometry.
    pub fn create(info: TorrentInfo, root: PathBuf) -> Result<Self, StorageError> {
        let files = info
            .files
            .iter()
            .map(|f| FileEntry::new(f.path.clone(), f.length, f.offset))
            .collect();
        let storage = TorrentStorage::new(
            root,
            files,
            info.piece_length,
            info.total_length,
            info.piece_hashes.clone(),
        )?;
        let pieces = PieceMap::new(
            info.piece_length,
            info.total_length,
            info.piece_hashes.clone(),
        );
        Ok(Self {
            info,
            pieces,
            storage,
        })
    }
}

/// Shared slot sessions watch for the runtime to appear.
pub type SharedTorrent = Arc<RwLock<Option<Arc<TorrentRuntime>>>>;

/// An empty shared slot, for magnet bootstrap.
pub fn empty_shared() -> SharedTorrent {
    Arc::new(RwLock::new(None))
}

/// A pre-filled shared slot, for `.torrent` startup.
pub fn filled_shared(runtime: Arc<TorrentRuntime>) -> SharedTorrent {
    Arc::new(RwLock::new(Some(runtime)))
}
