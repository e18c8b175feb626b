use super::error::PeerError;
use crate::constants::{DHT_BIT, EXTENSION_BIT, PROTOCOL_STRING};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length of the fixed-size handshake message.
pub const HANDSHAKE_LEN: usize = 68;

/// The BitTorrent handshake: protocol string, reserved capability bits,
/// info hash, and peer id.
///
/// Reserved bits we set and understand: byte 5 bit 0x10 (extension
/// protocol, BEP-10) and byte 7 bit 0x01 (DHT, BEP-5).
#[derive(Debug, Clone)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    /// Builds our outgoing handshake with the extension bit set.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= EXTENSION_BIT;
        reserved[7] |= DHT_BIT;
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & EXTENSION_BIT != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & DHT_BIT != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN || data[0] != 19 || &data[1..20] != PROTOCOL_STRING {
            return Err(PeerError::InvalidHandshake);
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);
        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// A decoded peer wire message.
///
/// Frames are a 4-byte big-endian length followed by a one-byte opcode and
/// payload; a zero-length frame is a keep-alive. Opcodes outside the base
/// protocol and the extension protocol decode to [`Message::Unknown`] so the
/// session can drop them without tearing the connection down.
#[derive(Debug, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    /// DHT listen port announcement (opcode 9).
    Port(u16),
    /// Extension protocol frame (opcode 20): sub-id plus raw payload.
    Extended { id: u8, payload: Bytes },
    /// An opcode we do not speak; dropped silently.
    Unknown(u8),
}

// Base protocol opcodes (BEP-3), plus 9 for DHT port and 20 for BEP-10.
const OP_CHOKE: u8 = 0;
const OP_UNCHOKE: u8 = 1;
const OP_INTERESTED: u8 = 2;
const OP_NOT_INTERESTED: u8 = 3;
const OP_HAVE: u8 = 4;
const OP_BITFIELD: u8 = 5;
const OP_REQUEST: u8 = 6;
const OP_PIECE: u8 = 7;
const OP_CANCEL: u8 = 8;
const OP_PORT: u8 = 9;
const OP_EXTENDED: u8 = 20;

impl Message {
    /// Encodes the message including its length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_bare(&mut buf, OP_CHOKE),
            Message::Unchoke => put_bare(&mut buf, OP_UNCHOKE),
            Message::Interested => put_bare(&mut buf, OP_INTERESTED),
            Message::NotInterested => put_bare(&mut buf, OP_NOT_INTERESTED),
            Message::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(OP_HAVE);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(OP_BITFIELD);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => put_triple(&mut buf, OP_REQUEST, *index, *begin, *length),
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(OP_PIECE);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => put_triple(&mut buf, OP_CANCEL, *index, *begin, *length),
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(OP_PORT);
                buf.put_u16(*port);
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(OP_EXTENDED);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            Message::Unknown(op) => {
                buf.put_u32(1);
                buf.put_u8(*op);
            }
        }
        buf.freeze()
    }

    /// Decodes one complete frame (length prefix included).
    pub fn decode(mut frame: Bytes) -> Result<Self, PeerError> {
        if frame.len() < 4 {
            return Err(PeerError::Protocol("frame shorter than prefix".into()));
        }
        let length = frame.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if frame.remaining() < length {
            return Err(PeerError::Protocol("frame body truncated".into()));
        }

        let opcode = frame.get_u8();
        let body = length - 1;
        match opcode {
            OP_CHOKE => Ok(Message::Choke),
            OP_UNCHOKE => Ok(Message::Unchoke),
            OP_INTERESTED => Ok(Message::Interested),
            OP_NOT_INTERESTED => Ok(Message::NotInterested),
            OP_HAVE => {
                if body != 4 {
                    return Err(PeerError::Protocol("have payload size".into()));
                }
                Ok(Message::Have {
                    piece: frame.get_u32(),
                })
            }
            OP_BITFIELD => Ok(Message::Bitfield(frame.copy_to_bytes(body))),
            OP_REQUEST | OP_CANCEL => {
                if body != 12 {
                    return Err(PeerError::Protocol("request payload size".into()));
                }
                let index = frame.get_u32();
                let begin = frame.get_u32();
                let len = frame.get_u32();
                Ok(if opcode == OP_REQUEST {
                    Message::Request {
                        index,
                        begin,
                        length: len,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length: len,
                    }
                })
            }
            OP_PIECE => {
                if body < 8 {
                    return Err(PeerError::Protocol("piece payload size".into()));
                }
                let index = frame.get_u32();
                let begin = frame.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    data: frame.copy_to_bytes(body - 8),
                })
            }
            OP_PORT => {
                if body != 2 {
                    return Err(PeerError::Protocol("port payload size".into()));
                }
                Ok(Message::Port(frame.get_u16()))
            }
            OP_EXTENDED => {
                if body < 1 {
                    return Err(PeerError::Protocol("extended payload size".into()));
                }
                let id = frame.get_u8();
                Ok(Message::Extended {
                    id,
                    payload: frame.copy_to_bytes(body - 1),
                })
            }
            other => Ok(Message::Unknown(other)),
        }
    }
}

fn put_bare(buf: &mut BytesMut, opcode: u8) {
    buf.put_u32(1);
    buf.put_u8(opcode);
}

fn put_triple(buf: &mut BytesMut, opcode: u8, index: u32, begin: u32, length: u32) {
    buf.put_u32(13);
    buf.put_u8(opcode);
    buf.put_u32(index);
    buf.put_u32(begin);
    buf.put_u32(length);
}
