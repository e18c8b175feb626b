//! Peer wire protocol (BEP-3) with the extension protocol (BEP-10),
//! metadata exchange (BEP-9), and PEX plumbing (BEP-11).
//!
//! [`PeerSession`] is the long-lived per-peer actor: it owns the socket,
//! drives the handshake and message loop, keeps the request pipeline full,
//! and reports everything the engine needs through its event channel.

mod bitfield;
mod error;
mod extension;
mod message;
mod metadata;
mod peer_id;
mod rate;
mod session;
mod transport;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use extension::{ExtensionHandshake, ExtensionMessage};
pub use message::{Handshake, Message, HANDSHAKE_LEN};
pub use metadata::{MetadataFetcher, MetadataMessage, MetadataMessageKind};
pub use peer_id::PeerId;
pub use rate::RateEstimator;
pub use session::{
    spawn_inbound, spawn_outbound, CloseReason, SessionCommand, SessionContext, SessionEvent,
};
pub use transport::{PeerStream, PeerTransport};
