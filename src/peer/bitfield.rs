use bytes::Bytes;

/// A piece-possession bitmap, bit `i` counted from the high bit of byte 0.
///
/// Both our own possession and each remote peer's are tracked in this
/// representation, which is also the wire format of the `bitfield` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    pieces: usize,
}

impl Bitfield {
    /// An all-zero bitfield for `pieces` pieces.
    pub fn new(pieces: usize) -> Self {
        Self {
            bytes: vec![0; pieces.div_ceil(8)],
            pieces,
        }
    }

    /// Parses a wire bitfield, enforcing the exact expected length and zero
    /// spare bits. Anything else is a protocol violation and returns `None`.
    pub fn from_wire(raw: &[u8], pieces: usize) -> Option<Self> {
        if raw.len() != pieces.div_ceil(8) {
            return None;
        }
        let spare = raw.len() * 8 - pieces;
        if spare > 0 {
            let mask = 0xFFu8 >> (8 - spare);
            if raw.last().copied().unwrap_or(0) & mask != 0 {
                return None;
            }
        }
        Some(Self {
            bytes: raw.to_vec(),
            pieces,
        })
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.pieces {
            return false;
        }
        self.bytes[index / 8] >> (7 - index % 8) & 1 == 1
    }

    pub fn set(&mut self, index: usize) {
        if index < self.pieces {
            self.bytes[index / 8] |= 1 << (7 - index % 8);
        }
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.pieces
    }

    /// Number of pieces the bitfield covers.
    pub fn len(&self) -> usize {
        self.pieces
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bytes)
    }

    /// True when `other` has a piece this bitfield lacks; drives the
    /// interested flag.
    pub fn is_behind(&self, other: &Bitfield) -> bool {
        (0..self.pieces.min(other.pieces)).any(|i| other.has(i) && !self.has(i))
    }
}
