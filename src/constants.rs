//! Protocol constants and tuning parameters.
//!
//! Central home for every timeout, cap, and wire-level constant the engine
//! uses. Values follow classic client behavior (qBittorrent, Transmission,
//! libtorrent) unless noted inline.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &str = "-RP0001-";

/// Client name/version reported in the extended handshake `v` field
pub const CLIENT_VERSION: &str = "riptide/0.1.0";

// ============================================================================
// Ports
// ============================================================================

/// Default BitTorrent listen port
pub const DEFAULT_PORT: u16 = 6881;

/// Environment variable consulted for a preferred listen port
pub const PORT_ENV_VAR: &str = "BT_PORT";

// ============================================================================
// Connection limits
// ============================================================================

/// Hard cap on simultaneously connected peers
pub const MAX_PEERS: usize = 50;

/// Soft target for connected peers; the dialer stops at this count
pub const TARGET_PEERS: usize = 30;

/// Upload slots granted by the choker, including the optimistic slot
pub const UPLOAD_SLOTS: usize = 4;

/// Candidate address pool capacity, deduplicated by address
pub const MAX_CANDIDATES: usize = 10_000;

/// Tolerated protocol slips (unsolicited blocks etc.) before a peer is dropped
pub const PEER_ERROR_BUDGET: u32 = 8;

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16KB), the unit of wire requests
pub const BLOCK_SIZE: u32 = 16384;

/// Maximum request length we will serve; larger requests are a violation
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Remaining-piece threshold below which endgame mode begins
pub const ENDGAME_PIECE_THRESHOLD: usize = 10;

/// Concurrent requesters allowed per block during endgame
pub const ENDGAME_MAX_DUP: usize = 3;

/// Metadata exchange piece size (BEP-9)
pub const METADATA_PIECE_SIZE: usize = 16384;

/// Upper bound on an info dictionary fetched from peers (1MB)
pub const MAX_METADATA_SIZE: usize = 1_048_576;

// ============================================================================
// Request pipelining
// ============================================================================

/// Outstanding block requests per peer before rate adaptation kicks in
pub const DEFAULT_PIPELINE_DEPTH: usize = 16;

/// Lower clamp for the adaptive pipeline depth
pub const MIN_PIPELINE_DEPTH: usize = 4;

/// Upper clamp for the adaptive pipeline depth
pub const MAX_PIPELINE_DEPTH: usize = 128;

// ============================================================================
// Timeouts
// ============================================================================

/// TCP connection establishment timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake must complete within this window after connect
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// A requested block not delivered within this window is re-requested
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A session with no traffic at all for this long is torn down
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Keep-alive message interval; must stay under the idle timeout
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

// ============================================================================
// Choking
// ============================================================================

/// Choke round interval
pub const CHOKE_INTERVAL: Duration = Duration::from_secs(10);

/// Every Nth choke round rotates the optimistic unchoke
pub const OPTIMISTIC_ROUND_PERIOD: u64 = 3;

/// An unchoked peer delivering nothing for this long counts as snubbed
pub const SNUB_TIMEOUT: Duration = Duration::from_secs(30);

/// Choke rounds a hash-failure trust penalty stays in effect
pub const TRUST_PENALTY_ROUNDS: u32 = 3;

/// Hash failures within [`BAN_WINDOW`] that trigger a session ban
pub const BAN_FAILURE_COUNT: u32 = 3;

/// Sliding window for counting hash failures toward a ban
pub const BAN_WINDOW: Duration = Duration::from_secs(3600);

// ============================================================================
// Reconnect backoff
// ============================================================================

/// First retry delay after a session failure
pub const BACKOFF_MIN: Duration = Duration::from_secs(30);

/// Retry delay ceiling; doubling stops here
pub const BACKOFF_MAX: Duration = Duration::from_secs(30 * 60);

// ============================================================================
// Intervals
// ============================================================================

/// Tracker announce interval used until the tracker supplies its own
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

/// PEX messages go out at most this often per peer (BEP-11)
pub const PEX_SEND_INTERVAL: Duration = Duration::from_secs(60);

/// Byte-rate EMA window for per-peer counters
pub const RATE_WINDOW: Duration = Duration::from_secs(20);

/// Engine housekeeping tick (timeout sweeps, dial attempts, progress)
pub const ENGINE_TICK: Duration = Duration::from_secs(1);

// ============================================================================
// Buffers and persistence
// ============================================================================

/// Maximum accepted wire message size; a block plus headers fits well within
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Recently-good addresses persisted in the resume record
pub const RESUME_PEERS_HINT: usize = 200;

// ============================================================================
// Protocol constants
// ============================================================================

/// BitTorrent protocol identifier
pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Extension protocol bit in reserved byte 5 (BEP-10)
pub const EXTENSION_BIT: u8 = 0x10;

/// DHT support bit in reserved byte 7 (BEP-5)
pub const DHT_BIT: u8 = 0x01;

/// Extended handshake sub-id (BEP-10)
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// Local message id assigned to ut_metadata in our `m` dictionary
pub const UT_METADATA_ID: u8 = 1;

/// Local message id assigned to ut_pex in our `m` dictionary
pub const UT_PEX_ID: u8 = 2;
