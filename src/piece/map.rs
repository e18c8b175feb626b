use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng as _;
use sha1::{Digest, Sha1};

use crate::constants::{BLOCK_SIZE, ENDGAME_MAX_DUP, ENDGAME_PIECE_THRESHOLD, REQUEST_TIMEOUT};
use crate::peer::Bitfield;

use super::block::{block_count, block_length, BlockRequest};

/// Peers are identified to the piece scheduler by their socket address,
/// which is unique across the swarm view.
pub type PeerKey = SocketAddr;

/// Outcome of [`PieceMap::deliver`].
#[derive(Debug)]
pub enum Delivery {
    /// The block was stored. `completed` is set when it finished a piece
    /// whose hash verified; `cancels` lists outstanding duplicate requests
    /// other peers hold for this block (endgame).
    Accepted {
        completed: Option<CompletedPiece>,
        cancels: Vec<(PeerKey, BlockRequest)>,
    },
    /// We already had this block.
    Duplicate,
    /// The block was not usable; see the reason.
    Rejected(RejectReason),
}

/// A piece whose blocks all arrived and whose SHA-1 matched.
///
/// The verified bytes are handed back to the caller for commit; the map
/// itself never touches the disk.
#[derive(Debug)]
pub struct CompletedPiece {
    pub index: u32,
    pub data: Bytes,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// Piece index out of range.
    UnknownPiece,
    /// The piece is already complete; never re-request (I2).
    AlreadyComplete,
    /// Offset not block-aligned or beyond the piece.
    BadOffset,
    /// Length does not match the block geometry.
    LengthMismatch,
    /// Assembled piece failed hash verification. Every peer that
    /// contributed a block is listed for trust accounting.
    HashMismatch { contributors: Vec<PeerKey> },
}

// One block of an in-flight piece. `requesters` holds every peer with an
// outstanding request for the block (at most one outside endgame).
#[derive(Debug)]
struct BlockSlot {
    length: u32,
    data: Option<Bytes>,
    source: Option<PeerKey>,
    requesters: Vec<(PeerKey, Instant)>,
}

#[derive(Debug)]
struct ActivePiece {
    blocks: Vec<BlockSlot>,
}

impl ActivePiece {
    fn new(piece_length: u64) -> Self {
        let count = block_count(piece_length);
        let blocks = (0..count)
            .map(|i| BlockSlot {
                length: block_length(piece_length, i),
                data: None,
                source: None,
                requesters: Vec::new(),
            })
            .collect();
        Self { blocks }
    }

    fn received(&self) -> usize {
        self.blocks.iter().filter(|b| b.data.is_some()).count()
    }

    fn is_filled(&self) -> bool {
        self.blocks.iter().all(|b| b.data.is_some())
    }

    fn assemble(&self, piece_length: u64) -> Bytes {
        let mut out = Vec::with_capacity(piece_length as usize);
        for slot in &self.blocks {
            if let Some(ref data) = slot.data {
                out.extend_from_slice(data);
            }
        }
        Bytes::from(out)
    }
}

// Candidate ordering key: lowest availability first, ties broken by lowest
// piece index. BTreeSet iteration order is exactly rarest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Rarity {
    availability: u32,
    piece: u32,
}

struct Inner {
    have: Bitfield,
    active: HashMap<u32, ActivePiece>,
    availability: Vec<u32>,
    candidates: BTreeSet<Rarity>,
    pending_broadcast: Vec<u32>,
}

/// Block-level bookkeeping and piece selection for one torrent.
///
/// All state lives behind a single lock; every operation is a short
/// critical section and callers see each operation as atomic.
pub struct PieceMap {
    piece_length: u64,
    total_length: u64,
    hashes: Vec<[u8; 20]>,
    endgame_threshold: usize,
    inner: RwLock<Inner>,
}

impl PieceMap {
    pub fn new(piece_length: u64, total_length: u64, hashes: Vec<[u8; 20]>) -> Self {
        let piece_count = hashes.len();
        let mut candidates = BTreeSet::new();
        for piece in 0..piece_count as u32 {
            candidates.insert(Rarity {
                availability: 0,
                piece,
            });
        }
        Self {
            piece_length,
            total_length,
            hashes,
            endgame_threshold: ENDGAME_PIECE_THRESHOLD,
            inner: RwLock::new(Inner {
                have: Bitfield::new(piece_count),
                active: HashMap::new(),
                availability: vec![0; piece_count],
                candidates,
                pending_broadcast: Vec::new(),
            }),
        }
    }

    /// Overrides the endgame entry threshold (pieces remaining).
    pub fn with_endgame_threshold(mut self, threshold: usize) -> Self {
        self.endgame_threshold = threshold;
        self
    }

    pub fn piece_count(&self) -> usize {
        self.hashes.len()
    }

    /// Actual length of piece `index`; only the last piece can be short.
    pub fn piece_size(&self, index: u32) -> u64 {
        let count = self.hashes.len() as u64;
        if count == 0 {
            0
        } else if u64::from(index) + 1 < count {
            self.piece_length
        } else {
            self.total_length - (count - 1) * self.piece_length
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner.read().have.is_complete()
    }

    pub fn have_count(&self) -> usize {
        self.inner.read().have.count()
    }

    /// Bytes still missing, for tracker `left` reporting.
    pub fn bytes_left(&self) -> u64 {
        let inner = self.inner.read();
        (0..self.hashes.len() as u32)
            .filter(|&i| !inner.have.has(i as usize))
            .map(|i| self.piece_size(i))
            .sum()
    }

    /// Copy of our bitfield, for handshakes and resume snapshots.
    pub fn bitfield(&self) -> Bitfield {
        self.inner.read().have.clone()
    }

    pub fn availability(&self, piece: u32) -> u32 {
        self.inner
            .read()
            .availability
            .get(piece as usize)
            .copied()
            .unwrap_or(0)
    }

    /// True while endgame duplicate-request mode is in effect.
    pub fn is_endgame(&self) -> bool {
        let inner = self.inner.read();
        self.endgame(&inner)
    }

    fn endgame(&self, inner: &Inner) -> bool {
        let remaining = self.hashes.len() - inner.have.count();
        remaining > 0 && remaining <= self.endgame_threshold
    }

    // ------------------------------------------------------------------
    // Availability maintenance
    // ------------------------------------------------------------------

    /// Applies a freshly received peer bitfield to the availability vector.
    pub fn add_bitfield(&self, bits: &Bitfield) {
        let mut inner = self.inner.write();
        for piece in 0..self.hashes.len() {
            if bits.has(piece) {
                Self::shift_availability(&mut inner, piece as u32, 1);
            }
        }
    }

    /// Records a HAVE announcement. Applying the same HAVE twice simply
    /// counts the peer's copy twice, so callers gate on the remote
    /// bitfield; the map itself stays consistent either way.
    pub fn add_have(&self, piece: u32) {
        if (piece as usize) < self.hashes.len() {
            let mut inner = self.inner.write();
            Self::shift_availability(&mut inner, piece, 1);
        }
    }

    /// Removes a departing peer: its bitfield leaves the availability
    /// vector and its outstanding requests are released.
    pub fn peer_gone(&self, bits: &Bitfield, peer: PeerKey) {
        let mut inner = self.inner.write();
        for piece in 0..self.hashes.len() {
            if bits.has(piece) {
                Self::shift_availability(&mut inner, piece as u32, -1);
            }
        }
        for active in inner.active.values_mut() {
            for slot in &mut active.blocks {
                slot.requesters.retain(|(p, _)| *p != peer);
            }
        }
    }

    fn shift_availability(inner: &mut Inner, piece: u32, delta: i32) {
        let idx = piece as usize;
        let old = inner.availability[idx];
        let new = if delta > 0 {
            old.saturating_add(delta as u32)
        } else {
            old.saturating_sub(delta.unsigned_abs())
        };
        inner.availability[idx] = new;

        if !inner.have.has(idx) {
            inner.candidates.remove(&Rarity {
                availability: old,
                piece,
            });
            inner.candidates.insert(Rarity {
                availability: new,
                piece,
            });
        }
    }

    // ------------------------------------------------------------------
    // Request scheduling
    // ------------------------------------------------------------------

    /// Picks the next block to request from a peer advertising `bits`.
    ///
    /// Selection is rarest-first with lowest-index tie-break. While nothing
    /// has been downloaded yet, the first piece is instead drawn uniformly
    /// from the four rarest eligible pieces to avoid swarm herding. Within
    /// a piece, blocks are handed out in ascending offset. Outside endgame
    /// every block goes to at most one peer; in endgame up to three peers
    /// may chase the same block, but never the same peer twice.
    pub fn next_request(&self, peer: PeerKey, bits: &Bitfield) -> Option<BlockRequest> {
        let mut inner = self.inner.write();
        let endgame = self.endgame(&inner);
        let max_dup = if endgame { ENDGAME_MAX_DUP } else { 1 };

        let cold_start = inner.have.is_empty() && inner.active.is_empty();
        if cold_start {
            let pool: Vec<u32> = inner
                .candidates
                .iter()
                .filter(|r| bits.has(r.piece as usize))
                .take(4)
                .map(|r| r.piece)
                .collect();
            if !pool.is_empty() {
                let piece = pool[rand::rng().random_range(0..pool.len())];
                return self.claim_block(&mut inner, peer, piece, max_dup);
            }
            return None;
        }

        let order: Vec<u32> = inner
            .candidates
            .iter()
            .filter(|r| bits.has(r.piece as usize))
            .map(|r| r.piece)
            .collect();
        for piece in order {
            if let Some(request) = self.claim_block(&mut inner, peer, piece, max_dup) {
                return Some(request);
            }
        }
        None
    }

    fn claim_block(
        &self,
        inner: &mut Inner,
        peer: PeerKey,
        piece: u32,
        max_dup: usize,
    ) -> Option<BlockRequest> {
        let piece_len = self.piece_size(piece);
        let active = inner
            .active
            .entry(piece)
            .or_insert_with(|| ActivePiece::new(piece_len));

        for (block_index, slot) in active.blocks.iter_mut().enumerate() {
            if slot.data.is_some() {
                continue;
            }
            if slot.requesters.len() >= max_dup {
                continue;
            }
            if slot.requesters.iter().any(|(p, _)| *p == peer) {
                continue;
            }
            slot.requesters.push((peer, Instant::now()));
            return Some(BlockRequest {
                piece,
                offset: block_index as u32 * BLOCK_SIZE,
                length: slot.length,
            });
        }
        None
    }

    /// Releases every outstanding claim a peer holds, without touching
    /// availability; used when the peer chokes us.
    pub fn release_peer(&self, peer: PeerKey) {
        let mut inner = self.inner.write();
        for active in inner.active.values_mut() {
            for slot in &mut active.blocks {
                slot.requesters.retain(|(p, _)| *p != peer);
            }
        }
    }

    /// Drops requester entries older than the request timeout so their
    /// blocks become schedulable again.
    pub fn reclaim_expired(&self, now: Instant) {
        let mut inner = self.inner.write();
        for active in inner.active.values_mut() {
            for slot in &mut active.blocks {
                slot.requesters
                    .retain(|(_, at)| now.duration_since(*at) < REQUEST_TIMEOUT);
            }
        }
    }

    // ------------------------------------------------------------------
    // Block delivery
    // ------------------------------------------------------------------

    /// Stores a received block and, when it completes a piece, verifies the
    /// assembly against the expected hash.
    ///
    /// Verified bytes come back in [`Delivery::Accepted`] for the caller to
    /// commit; nothing reaches the disk before verification (I4). A hash
    /// mismatch resets every block of the piece and names the contributing
    /// peers so the caller can penalize them.
    pub fn deliver(&self, peer: PeerKey, piece: u32, offset: u32, data: Bytes) -> Delivery {
        let mut inner = self.inner.write();

        if piece as usize >= self.hashes.len() {
            return Delivery::Rejected(RejectReason::UnknownPiece);
        }
        if inner.have.has(piece as usize) {
            return Delivery::Rejected(RejectReason::AlreadyComplete);
        }

        let piece_len = self.piece_size(piece);
        if offset % BLOCK_SIZE != 0 || u64::from(offset) >= piece_len {
            return Delivery::Rejected(RejectReason::BadOffset);
        }

        // Unsolicited blocks for a piece we never started are still usable;
        // allocate the slots on demand.
        let active = inner
            .active
            .entry(piece)
            .or_insert_with(|| ActivePiece::new(piece_len));

        let block_index = (offset / BLOCK_SIZE) as usize;
        let slot = &mut active.blocks[block_index];
        if data.len() as u32 != slot.length {
            return Delivery::Rejected(RejectReason::LengthMismatch);
        }
        if slot.data.is_some() {
            slot.requesters.retain(|(p, _)| *p != peer);
            return Delivery::Duplicate;
        }

        let block_len = slot.length;
        slot.data = Some(data);
        slot.source = Some(peer);
        let cancels: Vec<(PeerKey, BlockRequest)> = slot
            .requesters
            .drain(..)
            .filter(|(p, _)| *p != peer)
            .map(|(p, _)| {
                (
                    p,
                    BlockRequest {
                        piece,
                        offset,
                        length: block_len,
                    },
                )
            })
            .collect();

        if !active.is_filled() {
            return Delivery::Accepted {
                completed: None,
                cancels,
            };
        }

        // Last block arrived: verify the whole piece.
        let assembled = active.assemble(piece_len);
        let mut hasher = Sha1::new();
        hasher.update(&assembled);
        let digest: [u8; 20] = hasher.finalize().into();

        if digest == self.hashes[piece as usize] {
            inner.active.remove(&piece);
            inner.have.set(piece as usize);
            let avail = inner.availability[piece as usize];
            inner.candidates.remove(&Rarity {
                availability: avail,
                piece,
            });
            inner.pending_broadcast.push(piece);
            tracing::debug!(piece, "piece verified");
            Delivery::Accepted {
                completed: Some(CompletedPiece {
                    index: piece,
                    data: assembled,
                }),
                cancels,
            }
        } else {
            let mut contributors: Vec<PeerKey> =
                active.blocks.iter().filter_map(|b| b.source).collect();
            contributors.sort_unstable();
            contributors.dedup();
            inner.active.remove(&piece);
            tracing::warn!(piece, "piece failed hash check, re-queuing");
            Delivery::Rejected(RejectReason::HashMismatch { contributors })
        }
    }

    // ------------------------------------------------------------------
    // Broadcast and resume
    // ------------------------------------------------------------------

    /// Drains pieces verified since the last call, for HAVE fan-out.
    pub fn pending_broadcast(&self) -> Vec<u32> {
        std::mem::take(&mut self.inner.write().pending_broadcast)
    }

    /// Marks a piece complete without going through delivery; used when a
    /// resume record's claim has been re-verified against the disk. Does
    /// not queue a HAVE broadcast.
    pub fn restore_complete(&self, piece: u32) {
        let idx = piece as usize;
        if idx >= self.hashes.len() {
            return;
        }
        let mut inner = self.inner.write();
        if inner.have.has(idx) {
            return;
        }
        inner.have.set(idx);
        inner.active.remove(&piece);
        let avail = inner.availability[idx];
        inner.candidates.remove(&Rarity {
            availability: avail,
            piece,
        });
    }

    /// Number of received blocks for a piece, for progress reporting.
    pub fn received_blocks(&self, piece: u32) -> usize {
        self.inner
            .read()
            .active
            .get(&piece)
            .map(|a| a.received())
            .unwrap_or(0)
    }

    /// Count of peers with outstanding requests for a given block; test
    /// and diagnostics hook for the duplicate-request invariant.
    pub fn requester_count(&self, piece: u32, offset: u32) -> usize {
        self.inner
            .read()
            .active
            .get(&piece)
            .and_then(|a| a.blocks.get((offset / BLOCK_SIZE) as usize))
            .map(|slot| slot.requesters.len())
            .unwrap_or(0)
    }
}
