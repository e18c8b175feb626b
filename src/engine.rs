//! The engine loop: owns sessions, dispatches candidates, runs the
//! periodic ticks, and carries a download from metainfo or magnet to
//! completion and seeding.
//!
//! Everything converges here: tracker and PEX addresses feed the
//! candidate pool, sessions report through one event channel, the choker
//! flips choke bits every ten seconds, verified pieces are committed to
//! storage and fanned out as HAVEs, and shutdown drains the disk before
//! the resume record is written.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::constants::{
    ANNOUNCE_INTERVAL, CHOKE_INTERVAL, DEFAULT_PORT, ENGINE_TICK, MAX_PEERS, PEX_SEND_INTERVAL,
    PORT_ENV_VAR, RESUME_PEERS_HINT, TARGET_PEERS,
};
use crate::metainfo::{InfoHash, MagnetLink, Metainfo, MetainfoError, TorrentInfo};
use crate::peer::{
    spawn_inbound, spawn_outbound, CloseReason, MetadataFetcher, PeerId, SessionCommand,
    SessionContext, SessionEvent,
};
use crate::pex::{PexMessage, PexPeer};
use crate::resume::{ResumeError, ResumeRecord};
use crate::storage::StorageError;
use crate::swarm::{CandidatePool, Choker, PeerRecord, PeerRegistry};
use crate::torrent::{empty_shared, SharedTorrent, TorrentRuntime};
use crate::tracker::{announce_url, AnnounceStats, TrackerEvent};

/// Engine-fatal failures. Per-peer trouble never reaches this type; it is
/// recovered inside the sessions and the pool.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Disk failure during a verified-piece commit; data would be lost by
    /// continuing.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("resume error: {0}")]
    Resume(#[from] ResumeError),
}

/// Engine tuning handed in by the binary.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Download root directory.
    pub root: PathBuf,
    /// Listen port preference; `BT_PORT` and then an ephemeral port are
    /// the fallbacks.
    pub listen_port: Option<u16>,
    /// Keep seeding after the download completes.
    pub seed: bool,
}

impl EngineConfig {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            listen_port: None,
            seed: false,
        }
    }
}

/// A point-in-time progress snapshot, published on a watch channel.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub pieces_total: usize,
    pub pieces_have: usize,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub connected_peers: usize,
    pub known_peers: usize,
    pub complete: bool,
}

struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    task: JoinHandle<()>,
}

struct AnnounceOutcome {
    peers: Vec<SocketAddr>,
    interval: Option<Duration>,
}

/// The engine. Build one from a metainfo file or a magnet link, then
/// [`run`](Engine::run) it; cancel the run future and call
/// [`shutdown`](Engine::shutdown) for a clean stop with a resume record.
pub struct Engine {
    info_hash: InfoHash,
    our_id: PeerId,
    config: EngineConfig,
    trackers: Vec<String>,
    initial_info: Option<TorrentInfo>,
    initial_candidates: Vec<SocketAddr>,

    torrent: SharedTorrent,
    fetcher: Arc<MetadataFetcher>,
    registry: Arc<PeerRegistry>,
    choker: Choker,
    pool: CandidatePool,
    sessions: HashMap<SocketAddr, SessionHandle>,

    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    announce_tx: mpsc::Sender<AnnounceOutcome>,
    announce_rx: mpsc::Receiver<AnnounceOutcome>,
    progress_tx: watch::Sender<Progress>,

    listen_port: u16,
    announce_interval: Duration,
    next_announce: Instant,
    completed_announced: bool,
    closed_downloaded: u64,
    closed_uploaded: u64,
    base_downloaded: u64,
    base_uploaded: u64,
    pex_last: HashSet<SocketAddr>,
    pieces_since_save: usize,
}

impl Engine {
    /// Builds an engine from a parsed `.torrent` file.
    pub fn from_metainfo(metainfo: Metainfo, config: EngineConfig) -> Self {
        let trackers = metainfo.trackers();
        Self::build(
            metainfo.info.info_hash,
            trackers,
            Some(metainfo.info),
            Vec::new(),
            config,
        )
    }

    /// Builds an engine from a magnet link; metadata comes from peers.
    pub fn from_magnet(magnet: MagnetLink, config: EngineConfig) -> Self {
        let candidates = magnet
            .peer_addresses
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        Self::build(
            magnet.info_hash,
            magnet.trackers.clone(),
            None,
            candidates,
            config,
        )
    }

    fn build(
        info_hash: InfoHash,
        trackers: Vec<String>,
        initial_info: Option<TorrentInfo>,
        initial_candidates: Vec<SocketAddr>,
        config: EngineConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (announce_tx, announce_rx) = mpsc::channel(8);
        let (progress_tx, _) = watch::channel(Progress::default());
        Self {
            info_hash,
            our_id: PeerId::generate(),
            config,
            trackers,
            initial_info,
            initial_candidates,
            torrent: empty_shared(),
            fetcher: Arc::new(MetadataFetcher::new(info_hash)),
            registry: Arc::new(PeerRegistry::new()),
            choker: Choker::new(),
            pool: CandidatePool::new(),
            sessions: HashMap::new(),
            events_tx,
            events_rx,
            announce_tx,
            announce_rx,
            progress_tx,
            listen_port: 0,
            announce_interval: ANNOUNCE_INTERVAL,
            next_announce: Instant::now(),
            completed_announced: false,
            closed_downloaded: 0,
            closed_uploaded: 0,
            base_downloaded: 0,
            base_uploaded: 0,
            pex_last: HashSet::new(),
            pieces_since_save: 0,
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Watch channel carrying [`Progress`] snapshots, updated every tick.
    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress_tx.subscribe()
    }

    /// Feeds an address into the candidate pool.
    pub fn add_candidate(&mut self, addr: SocketAddr) {
        self.pool.add(addr);
    }

    fn resume_path(&self) -> PathBuf {
        self.config
            .root
            .join(format!(".{}.resume", self.info_hash.to_hex()))
    }

    fn runtime(&self) -> Option<Arc<TorrentRuntime>> {
        self.torrent.read().clone()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Runs the engine until the download completes (and seeding is off)
    /// or a fatal error occurs. Cancel this future and call
    /// [`shutdown`](Engine::shutdown) for Ctrl+C handling.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let listener = self.bind_listener().await?;

        if let Some(info) = self.initial_info.take() {
            self.install_runtime(info).await?;
        }
        for addr in std::mem::take(&mut self.initial_candidates) {
            self.pool.add(addr);
        }

        self.spawn_announce(TrackerEvent::Started);
        self.next_announce = Instant::now() + self.announce_interval;

        let mut tick = tokio::time::interval(ENGINE_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut choke_tick = tokio::time::interval(CHOKE_INTERVAL);
        choke_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pex_tick = tokio::time::interval(PEX_SEND_INTERVAL);
        pex_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            enum Step {
                Event(SessionEvent),
                Announced(AnnounceOutcome),
                Incoming(std::io::Result<(TcpStream, SocketAddr)>),
                Choke,
                Pex,
                Tick,
            }
            let step = tokio::select! {
                Some(event) = self.events_rx.recv() => Step::Event(event),
                Some(outcome) = self.announce_rx.recv() => Step::Announced(outcome),
                accepted = listener.accept() => Step::Incoming(accepted),
                _ = choke_tick.tick() => Step::Choke,
                _ = pex_tick.tick() => Step::Pex,
                _ = tick.tick() => Step::Tick,
            };
            match step {
                Step::Event(event) => self.handle_event(event).await?,
                Step::Announced(outcome) => {
                    if let Some(interval) = outcome.interval {
                        self.announce_interval = interval;
                        self.next_announce = Instant::now() + interval;
                    }
                    for addr in outcome.peers {
                        self.pool.add(addr);
                    }
                }
                Step::Incoming(Ok((stream, addr))) => self.accept_peer(stream, addr),
                Step::Incoming(Err(error)) => {
                    tracing::warn!(%error, "accept failed");
                }
                Step::Choke => self.run_choke_round().await,
                Step::Pex => self.exchange_pex().await,
                Step::Tick => {
                    if self.tick().await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Graceful stop: sessions torn down, disk flushed, `stopped`
    /// announced, resume record written.
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        tracing::debug!("engine shutting down");
        for (_, handle) in self.sessions.drain() {
            let _ = handle.commands.try_send(SessionCommand::Shutdown);
            handle.task.abort();
        }
        for entry in self.registry.iter() {
            self.closed_downloaded += entry.value().downloaded();
            self.closed_uploaded += entry.value().uploaded();
        }
        self.registry.clear();

        let stats = self.stats();
        let trackers = self.trackers.clone();
        let info_hash = self.info_hash;
        let our_id = self.our_id;
        let port = self.listen_port;
        let farewell = tokio::time::timeout(Duration::from_secs(10), async move {
            for url in &trackers {
                if announce_url(url, &info_hash, &our_id, port, stats, TrackerEvent::Stopped)
                    .await
                    .is_ok()
                {
                    break;
                }
            }
        });
        let _ = farewell.await;

        if let Some(rt) = self.runtime() {
            rt.storage.flush().await;
            self.save_resume(&rt).await?;
        }
        Ok(())
    }

    async fn bind_listener(&mut self) -> Result<TcpListener, EngineError> {
        let preferred = self
            .config
            .listen_port
            .or_else(|| std::env::var(PORT_ENV_VAR).ok()?.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let listener = match TcpListener::bind(("0.0.0.0", preferred)).await {
            Ok(listener) => listener,
            Err(error) => {
                tracing::debug!(%error, preferred, "preferred port taken, using ephemeral");
                TcpListener::bind(("0.0.0.0", 0)).await?
            }
        };
        self.listen_port = listener.local_addr()?.port();
        tracing::debug!(port = self.listen_port, "listening for peers");
        Ok(listener)
    }

    /// Builds the runtime for freshly available metadata and applies any
    /// resume record: pieces the record claims are re-verified against the
    /// disk, and anything that fails is downgraded to missing.
    async fn install_runtime(&mut self, info: TorrentInfo) -> Result<(), EngineError> {
        let runtime = Arc::new(TorrentRuntime::create(info, self.config.root.clone())?);

        if let Some(record) = ResumeRecord::load(&self.resume_path()).await? {
            if record.info_hash == self.info_hash
                && record.piece_length == runtime.info.piece_length
                && record.piece_count as usize == runtime.info.piece_count()
            {
                let mut restored = 0usize;
                for piece in 0..runtime.info.piece_count() as u32 {
                    if !record.has_piece(piece) {
                        continue;
                    }
                    if runtime.storage.verify_piece(piece).await? {
                        runtime.pieces.restore_complete(piece);
                        restored += 1;
                    } else {
                        tracing::warn!(piece, "resume claimed piece failed re-verification");
                    }
                }
                for addr in &record.peers_hint {
                    self.pool.add(*addr);
                }
                self.base_downloaded = record.downloaded;
                self.base_uploaded = record.uploaded;
                tracing::debug!(restored, "resume state applied");
            } else {
                tracing::warn!("resume record does not match torrent, ignoring");
            }
        }

        *self.torrent.write() = Some(runtime);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    /// One housekeeping tick. Returns true when the run is finished.
    async fn tick(&mut self) -> Result<bool, EngineError> {
        let now = Instant::now();

        if let Some(rt) = self.runtime() {
            rt.pieces.reclaim_expired(now);

            // HAVE fan-out for pieces verified since the last tick.
            for piece in rt.pieces.pending_broadcast() {
                for handle in self.sessions.values() {
                    let _ = handle.commands.try_send(SessionCommand::Announce(piece));
                }
            }

            if rt.pieces.is_complete() && !self.completed_announced {
                self.completed_announced = true;
                tracing::info!("download complete");
                self.spawn_announce(TrackerEvent::Completed);
                rt.storage.flush().await;
                self.save_resume(&rt).await?;
                if !self.config.seed {
                    return Ok(true);
                }
            }
        }

        if now >= self.next_announce {
            self.next_announce = now + self.announce_interval;
            self.spawn_announce(TrackerEvent::None);
        }

        self.dial_candidates(now);
        self.publish_progress();
        Ok(false)
    }

    fn dial_candidates(&mut self, now: Instant) {
        while self.sessions.len() < TARGET_PEERS {
            let Some(addr) = self.pool.checkout(now) else {
                break;
            };
            if self.sessions.contains_key(&addr) || self.choker.is_banned(&addr) {
                continue;
            }
            self.spawn_session(addr, None);
        }
    }

    fn accept_peer(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.sessions.contains_key(&addr)
            || self.choker.is_banned(&addr)
            || self.pool.is_banned(&addr)
        {
            return;
        }
        if self.sessions.len() >= MAX_PEERS {
            // While seeding, fresh peers beat the slowest current one;
            // while leeching a full swarm just refuses.
            let seeding = self
                .runtime()
                .map(|rt| rt.pieces.is_complete())
                .unwrap_or(false);
            if !seeding {
                return;
            }
            let slowest = self
                .registry
                .iter()
                .min_by(|a, b| {
                    a.value()
                        .upload_rate()
                        .partial_cmp(&b.value().upload_rate())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|entry| *entry.key());
            match slowest {
                Some(victim) => {
                    if let Some(handle) = self.sessions.get(&victim) {
                        let _ = handle.commands.try_send(SessionCommand::Shutdown);
                    }
                }
                None => return,
            }
        }
        self.pool.add(addr);
        self.pool.note_inbound(addr);
        self.spawn_session(addr, Some(stream));
    }

    fn spawn_session(&mut self, addr: SocketAddr, inbound: Option<TcpStream>) {
        let record = PeerRecord::new(addr);
        self.registry.insert(addr, record.clone());
        let (commands, command_rx) = mpsc::channel(64);
        let ctx = SessionContext {
            info_hash: self.info_hash,
            our_id: self.our_id,
            listen_port: self.listen_port,
            torrent: self.torrent.clone(),
            fetcher: self.fetcher.clone(),
            events: self.events_tx.clone(),
        };
        let task = match inbound {
            Some(stream) => spawn_inbound(stream, addr, ctx, record, command_rx),
            None => spawn_outbound(addr, ctx, record, command_rx),
        };
        self.sessions.insert(addr, SessionHandle { commands, task });
    }

    async fn run_choke_round(&mut self) {
        let seeding = self
            .runtime()
            .map(|rt| rt.pieces.is_complete())
            .unwrap_or(false);
        let decisions = self
            .choker
            .run_round(&self.registry, seeding, Instant::now());
        for decision in decisions {
            if let Some(handle) = self.sessions.get(&decision.addr) {
                let _ = handle
                    .commands
                    .try_send(SessionCommand::SetChoke(decision.choke));
            }
        }
    }

    /// Ships the connected-peers delta to every session; each session
    /// enforces the per-peer rate limit itself.
    async fn exchange_pex(&mut self) {
        let current: HashSet<SocketAddr> = self.sessions.keys().copied().collect();
        let mut message = PexMessage::new();
        for addr in current.difference(&self.pex_last) {
            message.added.push(PexPeer::new(*addr));
        }
        for addr in self.pex_last.difference(&current) {
            message.dropped.push(*addr);
        }
        self.pex_last = current;
        if message.is_empty() {
            return;
        }
        for (addr, handle) in &self.sessions {
            // A peer does not need to hear about itself.
            let mut trimmed = message.clone();
            trimmed.added.retain(|peer| peer.addr != *addr);
            trimmed.dropped.retain(|dropped| dropped != addr);
            if !trimmed.is_empty() {
                let _ = handle.commands.try_send(SessionCommand::Pex(trimmed));
            }
        }
    }

    // ------------------------------------------------------------------
    // Session events
    // ------------------------------------------------------------------

    async fn handle_event(&mut self, event: SessionEvent) -> Result<(), EngineError> {
        match event {
            SessionEvent::Connected {
                addr,
                peer_id,
                encrypted,
            } => {
                tracing::debug!(%addr, ?peer_id, encrypted, "peer connected");
            }
            SessionEvent::Verified { from, piece } => {
                let Some(rt) = self.runtime() else {
                    return Ok(());
                };
                // Commit failures lose verified data; that is fatal.
                // Earlier pieces are synced and the resume record is
                // snapshotted before surfacing.
                if let Err(error) = rt.storage.write_piece(piece.index, &piece.data).await {
                    tracing::error!(%error, piece = piece.index, "piece commit failed");
                    rt.storage.flush().await;
                    let _ = self.save_resume(&rt).await;
                    return Err(error.into());
                }
                self.pool.reset_backoff(from, Instant::now());
                self.pieces_since_save += 1;
                if self.pieces_since_save >= 16 {
                    self.pieces_since_save = 0;
                    rt.storage.flush().await;
                    self.save_resume(&rt).await?;
                }
            }
            SessionEvent::Cancels { pairs } => {
                for (addr, request) in pairs {
                    if let Some(handle) = self.sessions.get(&addr) {
                        let _ = handle.commands.try_send(SessionCommand::Cancel(request));
                    }
                }
            }
            SessionEvent::HashFailure {
                piece,
                contributors,
            } => {
                tracing::warn!(piece, ?contributors, "hash failure");
                let now = Instant::now();
                for addr in contributors {
                    if self.choker.record_hash_failure(addr, now) {
                        self.pool.ban(addr);
                        if let Some(handle) = self.sessions.get(&addr) {
                            let _ = handle.commands.try_send(SessionCommand::Shutdown);
                        }
                    }
                }
            }
            SessionEvent::MetadataComplete { raw } => {
                if self.runtime().is_none() {
                    let info = TorrentInfo::from_info_bytes(raw)?;
                    tracing::info!(name = %info.name, "metadata fetched and verified");
                    self.install_runtime(info).await?;
                }
            }
            SessionEvent::MetadataInvalid { contributors } => {
                for addr in contributors {
                    self.pool.ban(addr);
                    if let Some(handle) = self.sessions.get(&addr) {
                        let _ = handle.commands.try_send(SessionCommand::Shutdown);
                    }
                }
            }
            SessionEvent::PexPeers { peers } => {
                for addr in peers {
                    self.pool.add(addr);
                }
            }
            SessionEvent::Closed {
                addr,
                reason,
                productive,
            } => {
                tracing::debug!(%addr, ?reason, productive, "session closed");
                if let Some(handle) = self.sessions.remove(&addr) {
                    handle.task.abort();
                }
                if let Some((_, record)) = self.registry.remove(&addr) {
                    self.closed_downloaded += record.downloaded();
                    self.closed_uploaded += record.uploaded();
                }
                self.choker.peer_gone(&addr);
                let failed = !productive && reason != CloseReason::ShuttingDown;
                self.pool.release(addr, failed, Instant::now());
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Announce and accounting
    // ------------------------------------------------------------------

    fn total_downloaded(&self) -> u64 {
        let live: u64 = self
            .registry
            .iter()
            .map(|entry| entry.value().downloaded())
            .sum();
        self.base_downloaded + self.closed_downloaded + live
    }

    fn total_uploaded(&self) -> u64 {
        let live: u64 = self
            .registry
            .iter()
            .map(|entry| entry.value().uploaded())
            .sum();
        self.base_uploaded + self.closed_uploaded + live
    }

    fn stats(&self) -> AnnounceStats {
        AnnounceStats {
            uploaded: self.total_uploaded(),
            downloaded: self.total_downloaded(),
            left: self.runtime().map(|rt| rt.pieces.bytes_left()).unwrap_or(0),
        }
    }

    fn spawn_announce(&self, event: TrackerEvent) {
        if self.trackers.is_empty() {
            return;
        }
        let trackers = self.trackers.clone();
        let info_hash = self.info_hash;
        let our_id = self.our_id;
        let port = self.listen_port;
        let stats = self.stats();
        let tx = self.announce_tx.clone();

        tokio::spawn(async move {
            for url in &trackers {
                match announce_url(url, &info_hash, &our_id, port, stats, event).await {
                    Ok(response) => {
                        tracing::debug!(
                            url,
                            peers = response.peers.len(),
                            interval = response.interval,
                            "announce ok"
                        );
                        let floor = response.min_interval.unwrap_or(0);
                        let interval = response.interval.max(floor).max(1);
                        let _ = tx
                            .send(AnnounceOutcome {
                                peers: response.peers,
                                interval: Some(Duration::from_secs(u64::from(interval))),
                            })
                            .await;
                        return;
                    }
                    Err(error) => {
                        tracing::warn!(url, %error, "announce failed, trying next tracker");
                    }
                }
            }
        });
    }

    async fn save_resume(&self, rt: &TorrentRuntime) -> Result<(), EngineError> {
        let record = ResumeRecord::new(
            self.info_hash,
            rt.info.piece_length,
            rt.info.piece_count() as u32,
            rt.pieces.bitfield().to_bytes(),
            self.total_uploaded(),
            self.total_downloaded(),
            self.pool.recently_good(RESUME_PEERS_HINT),
        );
        record.save(&self.resume_path()).await?;
        Ok(())
    }

    fn publish_progress(&self) {
        let progress = match self.runtime() {
            Some(rt) => Progress {
                pieces_total: rt.pieces.piece_count(),
                pieces_have: rt.pieces.have_count(),
                downloaded: self.total_downloaded(),
                uploaded: self.total_uploaded(),
                left: rt.pieces.bytes_left(),
                connected_peers: self.sessions.len(),
                known_peers: self.pool.len(),
                complete: rt.pieces.is_complete(),
            },
            None => Progress {
                connected_peers: self.sessions.len(),
                known_peers: self.pool.len(),
                ..Default::default()
            },
        };
        let _ = self.progress_tx.send(progress);
    }
}
