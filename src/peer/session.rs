use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::extension::{ExtensionHandshake, ExtensionMessage};
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use super::metadata::{MetadataFetcher, MetadataMessage, MetadataMessageKind, MetadataProgress};
use super::peer_id::PeerId;
use super::transport::{PeerStream, PeerTransport};
use crate::constants::{
    BLOCK_SIZE, CONNECT_TIMEOUT, DEFAULT_PIPELINE_DEPTH, ENGINE_TICK, HANDSHAKE_TIMEOUT,
    IDLE_TIMEOUT, KEEPALIVE_INTERVAL, MAX_PIPELINE_DEPTH, MAX_REQUEST_LENGTH,
    METADATA_PIECE_SIZE, MIN_PIPELINE_DEPTH, PEER_ERROR_BUDGET, PEX_SEND_INTERVAL,
    REQUEST_TIMEOUT, UT_METADATA_ID, UT_PEX_ID,
};
use crate::metainfo::InfoHash;
use crate::mse::{self, MseOutcome};
use crate::pex::PexMessage;
use crate::piece::{BlockRequest, CompletedPiece, Delivery, PeerKey, RejectReason};
use crate::swarm::PeerRecord;
use crate::torrent::{SharedTorrent, TorrentRuntime};

/// Why a session ended. The engine uses this to decide backoff, banning,
/// and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer violated the protocol grammar or exhausted its error
    /// budget.
    ProtocolError,
    /// Handshake, request, or idle deadline expired.
    Timeout,
    /// The socket closed or failed.
    ConnectionClosed,
    /// We connected to ourselves.
    SelfConnection,
    /// The handshake never validated (wrong torrent, broken crypto).
    HandshakeFailed,
    /// The engine asked us to stop.
    ShuttingDown,
}

/// Engine-to-session instructions.
#[derive(Debug)]
pub enum SessionCommand {
    /// Choke or unchoke the remote.
    SetChoke(bool),
    /// Fan out a freshly verified piece.
    Announce(u32),
    /// Cancel an outstanding request (endgame duplicate arrived
    /// elsewhere).
    Cancel(BlockRequest),
    /// Ship a PEX delta, subject to the per-peer rate limit.
    Pex(PexMessage),
    /// Tear the session down gracefully.
    Shutdown,
}

/// Session-to-engine notifications.
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake completed and the message loop is running.
    Connected {
        addr: SocketAddr,
        peer_id: PeerId,
        encrypted: bool,
    },
    /// A piece assembled and passed verification; commit and broadcast.
    Verified {
        from: SocketAddr,
        piece: CompletedPiece,
    },
    /// Other peers hold duplicate requests for blocks that just arrived.
    Cancels {
        pairs: Vec<(PeerKey, BlockRequest)>,
    },
    /// A piece failed verification; penalize the contributors.
    HashFailure {
        piece: u32,
        contributors: Vec<PeerKey>,
    },
    /// The info dictionary arrived and matched the info hash.
    MetadataComplete { raw: Bytes },
    /// A fetched info dictionary hashed wrong; ban the contributors.
    MetadataInvalid { contributors: Vec<PeerKey> },
    /// Addresses gossiped by this peer.
    PexPeers { peers: Vec<SocketAddr> },
    /// The session is gone. `productive` is true when it delivered at
    /// least one verified piece.
    Closed {
        addr: SocketAddr,
        reason: CloseReason,
        productive: bool,
    },
}

/// Everything a session needs from the engine, cheap to clone per spawn.
#[derive(Clone)]
pub struct SessionContext {
    pub info_hash: InfoHash,
    pub our_id: PeerId,
    pub listen_port: u16,
    pub torrent: SharedTorrent,
    pub fetcher: Arc<MetadataFetcher>,
    pub events: mpsc::Sender<SessionEvent>,
}

/// Dials a peer and runs the session to completion.
///
/// The plaintext handshake goes first; if the peer drops that attempt, one
/// encrypted retry follows. Either way a `Closed` event is the last thing
/// the engine hears from this task.
pub fn spawn_outbound(
    addr: SocketAddr,
    ctx: SessionContext,
    record: Arc<PeerRecord>,
    commands: mpsc::Receiver<SessionCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match establish_outbound(addr, &ctx).await {
            Ok((transport, theirs, encrypted)) => {
                Session::new(addr, ctx, record, commands, transport, theirs, encrypted)
                    .run()
                    .await;
            }
            Err(error) => {
                tracing::debug!(%addr, %error, "outbound session failed to establish");
                let _ = ctx
                    .events
                    .send(SessionEvent::Closed {
                        addr,
                        reason: close_reason_for(&error),
                        productive: false,
                    })
                    .await;
            }
        }
    })
}

/// Adopts an accepted socket and runs the session to completion. The
/// first byte decides plaintext versus MSE.
pub fn spawn_inbound(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: SessionContext,
    record: Arc<PeerRecord>,
    commands: mpsc::Receiver<SessionCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match establish_inbound(stream, &ctx).await {
            Ok((transport, theirs, encrypted)) => {
                Session::new(addr, ctx, record, commands, transport, theirs, encrypted)
                    .run()
                    .await;
            }
            Err(error) => {
                tracing::debug!(%addr, %error, "inbound session failed to establish");
                let _ = ctx
                    .events
                    .send(SessionEvent::Closed {
                        addr,
                        reason: close_reason_for(&error),
                        productive: false,
                    })
                    .await;
            }
        }
    })
}

async fn establish_outbound(
    addr: SocketAddr,
    ctx: &SessionContext,
) -> Result<(PeerTransport, Handshake, bool), PeerError> {
    let ours = Handshake::new(*ctx.info_hash.as_bytes(), *ctx.our_id.as_bytes());

    match timeout(HANDSHAKE_TIMEOUT, plaintext_connect(addr, &ours)).await {
        Ok(Ok((transport, theirs))) => {
            validate_remote(ctx, &theirs)?;
            return Ok((transport, theirs, false));
        }
        Ok(Err(error @ (PeerError::SelfConnection | PeerError::InfoHashMismatch))) => {
            // The peer answered and is wrong for us; crypto won't help.
            return Err(error);
        }
        Ok(Err(error)) => {
            tracing::trace!(%addr, %error, "plaintext attempt failed, retrying encrypted");
        }
        Err(_) => {
            tracing::trace!(%addr, "plaintext attempt timed out, retrying encrypted");
        }
    }

    let (transport, theirs) = timeout(HANDSHAKE_TIMEOUT, encrypted_connect(addr, ctx, &ours))
        .await
        .map_err(|_| PeerError::Timeout)??;
    validate_remote(ctx, &theirs)?;
    Ok((transport, theirs, true))
}

async fn plaintext_connect(
    addr: SocketAddr,
    ours: &Handshake,
) -> Result<(PeerTransport, Handshake), PeerError> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::Timeout)??;
    let mut transport = PeerTransport::new(PeerStream::Plain(stream));
    transport.send_handshake(ours).await?;
    let theirs = transport.receive_handshake().await?;
    Ok((transport, theirs))
}

async fn encrypted_connect(
    addr: SocketAddr,
    ctx: &SessionContext,
    ours: &Handshake,
) -> Result<(PeerTransport, Handshake), PeerError> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::Timeout)??;
    let outcome = mse::initiate(&mut stream, ctx.info_hash.as_bytes(), &ours.encode()).await?;
    let peer_stream = match outcome {
        MseOutcome::Encrypted(ciphers) => PeerStream::Encrypted { stream, ciphers },
        MseOutcome::Plaintext => PeerStream::Plain(stream),
    };
    let mut transport = PeerTransport::new(peer_stream);
    let theirs = transport.receive_handshake().await?;
    Ok((transport, theirs))
}

async fn establish_inbound(
    mut stream: TcpStream,
    ctx: &SessionContext,
) -> Result<(PeerTransport, Handshake, bool), PeerError> {
    let ours = Handshake::new(*ctx.info_hash.as_bytes(), *ctx.our_id.as_bytes());

    let mut first = [0u8; 1];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut first))
        .await
        .map_err(|_| PeerError::Timeout)??;

    if first[0] == 19 {
        let mut rest = [0u8; HANDSHAKE_LEN - 1];
        timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut rest))
            .await
            .map_err(|_| PeerError::Timeout)??;
        let mut raw = [0u8; HANDSHAKE_LEN];
        raw[0] = 19;
        raw[1..].copy_from_slice(&rest);
        let theirs = Handshake::decode(&raw)?;
        validate_remote(ctx, &theirs)?;

        let mut transport = PeerTransport::new(PeerStream::Plain(stream));
        transport.send_handshake(&ours).await?;
        Ok((transport, theirs, false))
    } else {
        let (outcome, ia) = timeout(
            HANDSHAKE_TIMEOUT,
            mse::accept(&mut stream, ctx.info_hash.as_bytes(), first[0]),
        )
        .await
        .map_err(|_| PeerError::Timeout)??;
        let peer_stream = match outcome {
            MseOutcome::Encrypted(ciphers) => PeerStream::Encrypted { stream, ciphers },
            MseOutcome::Plaintext => PeerStream::Plain(stream),
        };
        let mut transport = PeerTransport::with_preloaded(peer_stream, &ia);
        let theirs = transport.receive_handshake().await?;
        validate_remote(ctx, &theirs)?;
        transport.send_handshake(&ours).await?;
        Ok((transport, theirs, true))
    }
}

fn validate_remote(ctx: &SessionContext, theirs: &Handshake) -> Result<(), PeerError> {
    if theirs.info_hash != *ctx.info_hash.as_bytes() {
        return Err(PeerError::InfoHashMismatch);
    }
    if theirs.peer_id == *ctx.our_id.as_bytes() {
        return Err(PeerError::SelfConnection);
    }
    Ok(())
}

fn close_reason_for(error: &PeerError) -> CloseReason {
    match error {
        PeerError::Protocol(_)
        | PeerError::Extension(_)
        | PeerError::Bencode(_)
        | PeerError::InvalidHandshake => CloseReason::ProtocolError,
        PeerError::Timeout => CloseReason::Timeout,
        PeerError::Io(_) | PeerError::ConnectionClosed => CloseReason::ConnectionClosed,
        PeerError::SelfConnection => CloseReason::SelfConnection,
        PeerError::InfoHashMismatch | PeerError::Encryption(_) => CloseReason::HandshakeFailed,
    }
}

struct Outstanding {
    length: u32,
    sent_at: Instant,
}

struct Session {
    addr: SocketAddr,
    ctx: SessionContext,
    record: Arc<PeerRecord>,
    commands: mpsc::Receiver<SessionCommand>,
    transport: PeerTransport,
    remote_id: PeerId,
    remote_supports_ext: bool,
    encrypted: bool,
    remote_ext: Option<ExtensionHandshake>,
    remote_bits: Option<Bitfield>,
    // Bitfield received while the torrent metadata is still unknown;
    // validated once the runtime appears.
    pending_raw_bits: Option<Bytes>,
    runtime: Option<Arc<TorrentRuntime>>,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    outstanding: HashMap<(u32, u32), Outstanding>,
    pipeline_limit: usize,
    rtt: f64,
    // True once any payload-phase message has arrived; a bitfield after
    // that point is out of order. Extended-handshake traffic does not
    // count, it belongs to connection setup.
    payload_seen: bool,
    bitfield_seen: bool,
    received_piece: bool,
    productive: bool,
    error_budget: u32,
    last_rx: Instant,
    last_tx: Instant,
    last_pex: Option<Instant>,
    md_requested_at: Option<Instant>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    fn new(
        addr: SocketAddr,
        ctx: SessionContext,
        record: Arc<PeerRecord>,
        commands: mpsc::Receiver<SessionCommand>,
        transport: PeerTransport,
        theirs: Handshake,
        encrypted: bool,
    ) -> Self {
        let remote_id = PeerId(theirs.peer_id);
        Self {
            addr,
            ctx,
            record,
            commands,
            transport,
            remote_id,
            remote_supports_ext: theirs.supports_extensions(),
            encrypted,
            remote_ext: None,
            remote_bits: None,
            pending_raw_bits: None,
            runtime: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            outstanding: HashMap::new(),
            pipeline_limit: DEFAULT_PIPELINE_DEPTH,
            rtt: 1.0,
            payload_seen: false,
            bitfield_seen: false,
            received_piece: false,
            productive: false,
            error_budget: PEER_ERROR_BUDGET,
            last_rx: Instant::now(),
            last_tx: Instant::now(),
            last_pex: None,
            md_requested_at: None,
        }
    }

    async fn run(mut self) {
        let reason = match self.drive().await {
            Ok(reason) => reason,
            Err(error) => {
                tracing::debug!(addr = %self.addr, %error, "session closed on error");
                close_reason_for(&error)
            }
        };
        self.teardown(reason).await;
    }

    async fn drive(&mut self) -> Result<CloseReason, PeerError> {
        let _ = self
            .ctx
            .events
            .send(SessionEvent::Connected {
                addr: self.addr,
                peer_id: self.remote_id,
                encrypted: self.encrypted,
            })
            .await;

        self.runtime = self.ctx.torrent.read().clone();

        if self.remote_supports_ext {
            let metadata_size = self.runtime.as_ref().map(|rt| rt.info.raw_info.len());
            let mut handshake = ExtensionHandshake::ours(self.ctx.listen_port, metadata_size);
            handshake.yourip = Some(match self.addr.ip() {
                std::net::IpAddr::V4(ip) => ip.octets().to_vec(),
                std::net::IpAddr::V6(ip) => ip.octets().to_vec(),
            });
            self.send(Message::Extended {
                id: 0,
                payload: handshake.encode(),
            })
            .await?;
        }
        if let Some(rt) = self.runtime.clone() {
            let bits = rt.pieces.bitfield();
            if !bits.is_empty() {
                self.send(Message::Bitfield(bits.to_bytes())).await?;
            }
        }

        let mut tick = tokio::time::interval(ENGINE_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Resolve the wakeup first so the arm futures release their
            // borrows before any handler touches the whole session.
            enum Step {
                Command(Option<SessionCommand>),
                Wire(Result<Message, PeerError>),
                Tick,
            }
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                message = self.transport.receive_message() => Step::Wire(message),
                _ = tick.tick() => Step::Tick,
            };
            match step {
                Step::Command(None) | Step::Command(Some(SessionCommand::Shutdown)) => {
                    return Ok(CloseReason::ShuttingDown);
                }
                Step::Command(Some(command)) => self.handle_command(command).await?,
                Step::Wire(message) => {
                    self.last_rx = Instant::now();
                    self.handle_message(message?).await?;
                }
                Step::Tick => self.housekeep().await?,
            }
        }
    }

    async fn teardown(mut self, reason: CloseReason) {
        if reason == CloseReason::ShuttingDown {
            // Best-effort courtesy before the socket drops.
            let _ = self.transport.send_message(&Message::NotInterested).await;
            let _ = self.transport.send_message(&Message::Choke).await;
        }
        if let Some(rt) = &self.runtime {
            match &self.remote_bits {
                Some(bits) => rt.pieces.peer_gone(bits, self.addr),
                None => rt.pieces.release_peer(self.addr),
            }
        }
        self.ctx.fetcher.peer_gone(self.addr);
        let _ = self
            .ctx
            .events
            .send(SessionEvent::Closed {
                addr: self.addr,
                reason,
                productive: self.productive,
            })
            .await;
    }

    async fn send(&mut self, message: Message) -> Result<(), PeerError> {
        self.transport.send_message(&message).await?;
        self.last_tx = Instant::now();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Engine commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: SessionCommand) -> Result<(), PeerError> {
        match command {
            SessionCommand::SetChoke(choke) => {
                if choke != self.am_choking {
                    self.am_choking = choke;
                    self.record.set_am_choking(choke);
                    let message = if choke { Message::Choke } else { Message::Unchoke };
                    self.send(message).await?;
                }
            }
            SessionCommand::Announce(piece) => {
                let already_has = self
                    .remote_bits
                    .as_ref()
                    .map(|bits| bits.has(piece as usize))
                    .unwrap_or(false);
                if !already_has {
                    self.send(Message::Have { piece }).await?;
                }
                self.update_interest().await?;
            }
            SessionCommand::Cancel(request) => {
                let was_outstanding = self
                    .outstanding
                    .remove(&(request.piece, request.offset))
                    .is_some();
                if was_outstanding && self.received_piece {
                    self.send(Message::Cancel {
                        index: request.piece,
                        begin: request.offset,
                        length: request.length,
                    })
                    .await?;
                }
            }
            SessionCommand::Pex(message) => {
                let due = self
                    .last_pex
                    .map(|at| at.elapsed() >= PEX_SEND_INTERVAL)
                    .unwrap_or(true);
                let remote_pex = self
                    .remote_ext
                    .as_ref()
                    .and_then(|ext| ext.remote_id("ut_pex"));
                if let (true, Some(id), false) = (due, remote_pex, message.is_empty()) {
                    self.last_pex = Some(Instant::now());
                    self.send(Message::Extended {
                        id,
                        payload: message.to_wire(),
                    })
                    .await?;
                }
            }
            SessionCommand::Shutdown => unreachable!("handled in drive"),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Wire messages
    // ------------------------------------------------------------------

    async fn handle_message(&mut self, message: Message) -> Result<(), PeerError> {
        if !matches!(
            message,
            Message::KeepAlive | Message::Extended { .. } | Message::Bitfield(_) | Message::Unknown(_)
        ) {
            self.payload_seen = true;
        }

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                self.record.set_peer_choking(true);
                // Outstanding requests are dead; cancel on the wire only
                // if this peer ever sent us a piece.
                if self.received_piece {
                    let dead: Vec<(u32, u32, u32)> = self
                        .outstanding
                        .iter()
                        .map(|((piece, offset), o)| (*piece, *offset, o.length))
                        .collect();
                    for (index, begin, length) in dead {
                        self.send(Message::Cancel {
                            index,
                            begin,
                            length,
                        })
                        .await?;
                    }
                }
                self.outstanding.clear();
                if let Some(rt) = &self.runtime {
                    rt.pieces.release_peer(self.addr);
                }
            }
            Message::Unchoke => {
                self.peer_choking = false;
                self.record.set_peer_choking(false);
                self.fill_pipeline().await?;
            }
            Message::Interested => self.record.set_peer_interested(true),
            Message::NotInterested => self.record.set_peer_interested(false),
            Message::Have { piece } => self.handle_have(piece).await?,
            Message::Bitfield(raw) => self.handle_bitfield(raw).await?,
            Message::Request {
                index,
                begin,
                length,
            } => self.handle_request(index, begin, length).await?,
            Message::Piece { index, begin, data } => self.handle_piece(index, begin, data).await?,
            Message::Cancel { .. } => {
                // Uploads are served inline, nothing queued to cancel.
            }
            Message::Port(_) => {
                // DHT port announcements are outside this engine.
            }
            Message::Extended { id, payload } => self.handle_extended(id, payload).await?,
            Message::Unknown(op) => {
                tracing::trace!(addr = %self.addr, op, "dropping unknown opcode");
            }
        }
        Ok(())
    }

    async fn handle_have(&mut self, piece: u32) -> Result<(), PeerError> {
        let Some(rt) = self.runtime.clone() else {
            // No geometry to validate against yet.
            return Ok(());
        };
        let count = rt.pieces.piece_count();
        if piece as usize >= count {
            return Err(PeerError::Protocol(format!("have {} out of range", piece)));
        }
        let fresh = {
            let bits = self
                .remote_bits
                .get_or_insert_with(|| Bitfield::new(count));
            if bits.has(piece as usize) {
                false
            } else {
                bits.set(piece as usize);
                true
            }
        };
        if fresh {
            rt.pieces.add_have(piece);
        }
        self.update_interest().await?;
        self.fill_pipeline().await
    }

    async fn handle_bitfield(&mut self, raw: Bytes) -> Result<(), PeerError> {
        if self.bitfield_seen || self.payload_seen {
            return Err(PeerError::Protocol("bitfield out of order".into()));
        }
        self.bitfield_seen = true;

        match self.runtime.clone() {
            Some(rt) => {
                let bits = Bitfield::from_wire(&raw, rt.pieces.piece_count())
                    .ok_or_else(|| PeerError::Protocol("bitfield size or padding".into()))?;
                rt.pieces.add_bitfield(&bits);
                self.remote_bits = Some(bits);
                self.update_interest().await?;
            }
            None => {
                // Validated once the metadata gives us the piece count.
                self.pending_raw_bits = Some(raw);
            }
        }
        Ok(())
    }

    async fn handle_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        if self.am_choking {
            // Requests crossing our choke are stale, not hostile.
            return Ok(());
        }
        let Some(rt) = self.runtime.clone() else {
            return Err(PeerError::Protocol("request before metadata".into()));
        };
        if length == 0 || length > MAX_REQUEST_LENGTH {
            return Err(PeerError::Protocol(format!("request length {}", length)));
        }
        if index as usize >= rt.pieces.piece_count()
            || u64::from(begin) + u64::from(length) > rt.pieces.piece_size(index)
        {
            return Err(PeerError::Protocol("request out of bounds".into()));
        }
        if !rt.pieces.bitfield().has(index as usize) {
            return Err(PeerError::Protocol("request for missing piece".into()));
        }

        match rt.storage.read_block(index, begin, length).await {
            Ok(data) => {
                self.record.note_uploaded(data.len());
                self.send(Message::Piece {
                    index,
                    begin,
                    data,
                })
                .await?;
            }
            Err(error) => {
                tracing::warn!(addr = %self.addr, %error, "failed to read block for upload");
            }
        }
        Ok(())
    }

    async fn handle_piece(&mut self, index: u32, begin: u32, data: Bytes) -> Result<(), PeerError> {
        let key = (index, begin);
        let solicited = match self.outstanding.remove(&key) {
            Some(outstanding) if outstanding.length as usize == data.len() => Some(outstanding),
            Some(_) | None => None,
        };
        if let Some(outstanding) = &solicited {
            let sample = outstanding.sent_at.elapsed().as_secs_f64();
            self.rtt = 0.8 * self.rtt + 0.2 * sample;
        }
        self.record.note_downloaded(data.len());

        let Some(rt) = self.runtime.clone() else {
            // Payload without metadata is noise.
            self.debit_budget()?;
            return self.fill_pipeline().await;
        };

        let outcome = rt.pieces.deliver(self.addr, index, begin, data);
        // Unsolicited data is tolerated but debited, except for blocks we
        // cancelled in endgame that were already on the wire.
        let endgame_straggler = matches!(
            outcome,
            Delivery::Duplicate | Delivery::Rejected(RejectReason::AlreadyComplete)
        );
        if solicited.is_none() && !endgame_straggler {
            self.debit_budget()?;
        }

        match outcome {
            Delivery::Accepted { completed, cancels } => {
                self.received_piece = true;
                if !cancels.is_empty() {
                    let _ = self
                        .ctx
                        .events
                        .send(SessionEvent::Cancels { pairs: cancels })
                        .await;
                }
                if let Some(piece) = completed {
                    self.productive = true;
                    let _ = self
                        .ctx
                        .events
                        .send(SessionEvent::Verified {
                            from: self.addr,
                            piece,
                        })
                        .await;
                }
            }
            Delivery::Duplicate => {
                // Normal in endgame; the duplicate has already been
                // cancelled at its other requesters.
            }
            Delivery::Rejected(RejectReason::HashMismatch { contributors }) => {
                let _ = self
                    .ctx
                    .events
                    .send(SessionEvent::HashFailure {
                        piece: index,
                        contributors,
                    })
                    .await;
            }
            Delivery::Rejected(_) => self.debit_budget()?,
        }

        self.fill_pipeline().await
    }

    async fn handle_extended(&mut self, id: u8, payload: Bytes) -> Result<(), PeerError> {
        match ExtensionMessage::decode(id, payload)? {
            ExtensionMessage::Handshake(handshake) => {
                if let Some(size) = handshake.metadata_size {
                    if size > 0 {
                        self.ctx.fetcher.announce_size(size as usize);
                    }
                }
                self.remote_ext = Some(handshake);
                self.maybe_request_metadata().await?;
            }
            ExtensionMessage::Known { id, payload } => {
                if id == UT_METADATA_ID {
                    self.handle_metadata_message(&payload).await?;
                } else if id == UT_PEX_ID {
                    let message = PexMessage::from_wire(&payload)
                        .ok_or_else(|| PeerError::Extension("malformed pex payload".into()))?;
                    let peers: Vec<SocketAddr> =
                        message.added.iter().map(|peer| peer.addr).collect();
                    if !peers.is_empty() {
                        let _ = self.ctx.events.send(SessionEvent::PexPeers { peers }).await;
                    }
                } else {
                    tracing::trace!(addr = %self.addr, id, "unknown extended sub-id");
                }
            }
        }
        Ok(())
    }

    async fn handle_metadata_message(&mut self, payload: &[u8]) -> Result<(), PeerError> {
        let message = MetadataMessage::decode(payload)?;
        match message.kind {
            MetadataMessageKind::Request => {
                let Some(remote_md) = self
                    .remote_ext
                    .as_ref()
                    .and_then(|ext| ext.remote_id("ut_metadata"))
                else {
                    return Ok(());
                };
                let reply = match self.runtime.clone() {
                    Some(rt) => {
                        let raw = &rt.info.raw_info;
                        let start = message.piece as usize * METADATA_PIECE_SIZE;
                        if start >= raw.len() {
                            MetadataMessage::reject(message.piece)
                        } else {
                            let end = (start + METADATA_PIECE_SIZE).min(raw.len());
                            MetadataMessage::data(
                                message.piece,
                                raw.len() as u32,
                                raw.slice(start..end),
                            )
                        }
                    }
                    None => MetadataMessage::reject(message.piece),
                };
                self.send(Message::Extended {
                    id: remote_md,
                    payload: reply.encode(),
                })
                .await?;
            }
            MetadataMessageKind::Data => {
                self.md_requested_at = None;
                let data = message
                    .data
                    .ok_or_else(|| PeerError::Extension("metadata data without payload".into()))?;
                match self.ctx.fetcher.deliver(self.addr, message.piece, data) {
                    MetadataProgress::Complete(raw) => {
                        let _ = self
                            .ctx
                            .events
                            .send(SessionEvent::MetadataComplete { raw })
                            .await;
                    }
                    MetadataProgress::Invalid { contributors } => {
                        let _ = self
                            .ctx
                            .events
                            .send(SessionEvent::MetadataInvalid { contributors })
                            .await;
                    }
                    MetadataProgress::Incomplete => {
                        self.maybe_request_metadata().await?;
                    }
                }
            }
            MetadataMessageKind::Reject => {
                self.md_requested_at = None;
                self.ctx.fetcher.reject(self.addr, message.piece);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    async fn housekeep(&mut self) -> Result<(), PeerError> {
        let now = Instant::now();

        if now.duration_since(self.last_rx) >= IDLE_TIMEOUT {
            return Err(PeerError::Timeout);
        }

        // Adopt the runtime the moment metadata materializes.
        if self.runtime.is_none() {
            if let Some(rt) = self.ctx.torrent.read().clone() {
                self.runtime = Some(rt.clone());
                if let Some(raw) = self.pending_raw_bits.take() {
                    let bits = Bitfield::from_wire(&raw, rt.pieces.piece_count())
                        .ok_or_else(|| PeerError::Protocol("bitfield size or padding".into()))?;
                    rt.pieces.add_bitfield(&bits);
                    self.remote_bits = Some(bits);
                }
            }
        }

        if now.duration_since(self.last_tx) >= KEEPALIVE_INTERVAL {
            self.send(Message::KeepAlive).await?;
        }

        // Requests past their deadline are abandoned here and reclaimed
        // inside the piece map by the engine's sweep.
        self.outstanding
            .retain(|_, outstanding| now.duration_since(outstanding.sent_at) < REQUEST_TIMEOUT);

        // Pipeline depth follows the bandwidth-delay product.
        self.record.sample_rates(now);
        let rate = self.record.download_rate();
        if rate > 0.0 {
            let depth = (rate * self.rtt / f64::from(BLOCK_SIZE)) as usize;
            self.pipeline_limit = depth.clamp(MIN_PIPELINE_DEPTH, MAX_PIPELINE_DEPTH);
        }

        if self.md_requested_at.is_some_and(|at| now.duration_since(at) >= REQUEST_TIMEOUT) {
            self.md_requested_at = None;
        }
        self.maybe_request_metadata().await?;

        self.update_interest().await?;
        self.fill_pipeline().await
    }

    async fn maybe_request_metadata(&mut self) -> Result<(), PeerError> {
        if self.runtime.is_some() || self.md_requested_at.is_some() {
            return Ok(());
        }
        let Some(remote_md) = self
            .remote_ext
            .as_ref()
            .and_then(|ext| ext.remote_id("ut_metadata"))
        else {
            return Ok(());
        };
        if !self.ctx.fetcher.is_armed() || self.ctx.fetcher.is_complete() {
            return Ok(());
        }
        if let Some(piece) = self.ctx.fetcher.next_request(self.addr) {
            self.md_requested_at = Some(Instant::now());
            self.send(Message::Extended {
                id: remote_md,
                payload: MetadataMessage::request(piece).encode(),
            })
            .await?;
        }
        Ok(())
    }

    async fn update_interest(&mut self) -> Result<(), PeerError> {
        let want = match (&self.runtime, &self.remote_bits) {
            (Some(rt), Some(bits)) => {
                !rt.pieces.is_complete() && rt.pieces.bitfield().is_behind(bits)
            }
            _ => false,
        };
        if want != self.am_interested {
            self.am_interested = want;
            self.record.set_am_interested(want);
            let message = if want {
                Message::Interested
            } else {
                Message::NotInterested
            };
            self.send(message).await?;
        }
        Ok(())
    }

    async fn fill_pipeline(&mut self) -> Result<(), PeerError> {
        if self.peer_choking || !self.am_interested {
            return Ok(());
        }
        let Some(rt) = self.runtime.clone() else {
            return Ok(());
        };
        let Some(bits) = self.remote_bits.clone() else {
            return Ok(());
        };

        while self.outstanding.len() < self.pipeline_limit {
            let Some(request) = rt.pieces.next_request(self.addr, &bits) else {
                break;
            };
            self.outstanding.insert(
                (request.piece, request.offset),
                Outstanding {
                    length: request.length,
                    sent_at: Instant::now(),
                },
            );
            self.send(Message::Request {
                index: request.piece,
                begin: request.offset,
                length: request.length,
            })
            .await?;
        }
        Ok(())
    }

    fn debit_budget(&mut self) -> Result<(), PeerError> {
        self.error_budget = self.error_budget.saturating_sub(1);
        if self.error_budget == 0 {
            Err(PeerError::Protocol("error budget exhausted".into()))
        } else {
            Ok(())
        }
    }
}
