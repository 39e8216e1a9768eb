//! The torrent actor: drives one torrent through `Starting` →
//! (`AcquiringMetadata` for magnet links) → `Downloading` → `Seeding`,
//! owns its peer connections, and periodically announces, chokes,
//! exchanges PEX, and checkpoints.
//!
//! Shaped like `dht::Dht`'s actor loop (a single `tokio::select!` over a
//! command channel and a handful of interval ticks), generalizing
//! `original_source/ccbt/session.py`'s `AsyncTorrentSession` (`start`,
//! `_announce_loop`, `_status_loop`, `_checkpoint_loop`) into that idiom.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime},
};

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::{
    checkpoint::{Checkpoint, CheckpointManager, FileCheckpoint},
    conf::TorrentConf,
    dht::DhtHandle,
    disk::DiskHandle,
    error::{CheckpointError, Error, Result},
    event::{Event, EventSink},
    metainfo::Metainfo,
    peer::{self, PeerSession, PeerStats},
    piece_manager::PieceManager,
    storage_info::StorageInfo,
    tracker::{AnnounceEvent, AnnounceRequest, Tracker, TrackerSession},
    PeerId, Sha1Hash, TorrentId,
};

use super::SharedTorrentContext;

/// How many of the torrent's interested peers we keep unchoked at once,
/// ranked by download rate, before the single optimistic-unchoke slot.
const UNCHOKE_SLOT_COUNT: usize = 4;
const CHOKE_TICK: Duration = Duration::from_secs(10);
const PEX_TICK: Duration = Duration::from_secs(60);
const CHECKPOINT_TICK: Duration = Duration::from_secs(30);
/// Every this many choke rounds, rotate the optimistic unchoke slot to a
/// randomly chosen choked-but-interested peer, per BEP 3's "roughly once
/// every 3 rounds" guidance.
const OPTIMISTIC_UNCHOKE_EVERY: u32 = 3;

/// How a torrent was added: from a complete `.torrent` file, or from a
/// magnet link whose metadata hasn't been fetched yet.
pub(crate) enum TorrentSource {
    /// A parsed `.torrent` file, plus the raw bytes it was parsed from
    /// (needed to recover the exact byte span of the `info` dictionary
    /// for peer-side `ut_metadata` serving and for re-deriving the info
    /// hash).
    Metainfo(Metainfo, Vec<u8>),
    Magnet {
        info_hash: Sha1Hash,
        trackers: Vec<String>,
    },
}

/// Everything needed to spawn a torrent actor.
pub(crate) struct TorrentParams {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub source: TorrentSource,
    pub conf: TorrentConf,
    pub client_id: PeerId,
    pub disk: DiskHandle,
    pub dht: Option<DhtHandle>,
    pub checkpoints: Arc<CheckpointManager>,
    pub events: EventSink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TorrentState {
    Starting,
    AcquiringMetadata,
    Downloading,
    Seeding,
    Paused,
    Stopped,
    Error(String),
}

/// A point-in-time snapshot of a torrent's progress, returned to callers
/// of [`TorrentHandle::status`].
#[derive(Debug, Clone)]
pub(crate) struct TorrentStatus {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub name: Option<String>,
    pub state: TorrentState,
    pub verified_pieces: usize,
    pub piece_count: usize,
    pub downloaded: u64,
    pub uploaded: u64,
    pub total_len: u64,
    pub peer_count: usize,
    pub download_rate: u64,
    pub upload_rate: u64,
}

pub(crate) enum Command {
    Pause,
    Resume,
    Stop,
    ForceAnnounce,
    GetStatus(oneshot::Sender<TorrentStatus>),
    Checkpoint(oneshot::Sender<std::result::Result<(), CheckpointError>>),
}

/// A cheap, cloneable handle to a running torrent actor.
#[derive(Clone)]
pub(crate) struct TorrentHandle {
    cmd_tx: mpsc::Sender<Command>,
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
}

impl TorrentHandle {
    pub async fn pause(&self) -> Result<()> {
        self.cmd_tx.send(Command::Pause).await.map_err(|_| Error::ChannelClosed)
    }

    pub async fn resume(&self) -> Result<()> {
        self.cmd_tx.send(Command::Resume).await.map_err(|_| Error::ChannelClosed)
    }

    pub async fn stop(&self) -> Result<()> {
        self.cmd_tx.send(Command::Stop).await.map_err(|_| Error::ChannelClosed)
    }

    pub async fn force_announce(&self) -> Result<()> {
        self.cmd_tx.send(Command::ForceAnnounce).await.map_err(|_| Error::ChannelClosed)
    }

    pub async fn status(&self) -> Result<TorrentStatus> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetStatus(tx))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    pub async fn checkpoint(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Checkpoint(tx))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)?.map_err(Error::from)
    }
}

/// Spawns a torrent actor and returns a handle to it. Heavy setup (disk
/// preallocation, checkpoint resume) happens inside the actor's own task
/// once it starts running, not here, so callers never block on it.
pub(crate) fn spawn(params: TorrentParams) -> TorrentHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let id = params.id;
    let info_hash = params.info_hash;
    let torrent = Torrent::new(params, cmd_rx);
    tokio::spawn(torrent.run());
    TorrentHandle { cmd_tx, id, info_hash }
}

struct ConnectedPeer {
    sender: peer::Sender,
    is_seed: bool,
}

pub(crate) struct Torrent {
    id: TorrentId,
    info_hash: Sha1Hash,
    conf: TorrentConf,
    client_id: PeerId,
    disk: DiskHandle,
    dht: Option<DhtHandle>,
    checkpoints: Arc<CheckpointManager>,
    events: EventSink,
    cmd_rx: mpsc::Receiver<Command>,
    source: TorrentSource,
    state: TorrentState,
    ctx: Option<Arc<SharedTorrentContext>>,
    trackers: Vec<TrackerSession>,
    peers: HashMap<SocketAddr, ConnectedPeer>,
    name: Option<String>,
    uploaded: u64,
    choke_round: u32,
}

impl Torrent {
    fn new(params: TorrentParams, cmd_rx: mpsc::Receiver<Command>) -> Self {
        Self {
            id: params.id,
            info_hash: params.info_hash,
            conf: params.conf,
            client_id: params.client_id,
            disk: params.disk,
            dht: params.dht,
            checkpoints: params.checkpoints,
            events: params.events,
            cmd_rx,
            source: params.source,
            state: TorrentState::Starting,
            ctx: None,
            trackers: Vec::new(),
            peers: HashMap::new(),
            name: None,
            uploaded: 0,
            choke_round: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        if let Err(e) = self.setup().await {
            log::error!("torrent {} failed to start: {}", self.id, e);
            self.state = TorrentState::Error(e.to_string());
        }

        let mut announce_tick = tokio::time::interval(self.conf.announce_interval);
        let mut choke_tick = tokio::time::interval(CHOKE_TICK);
        let mut pex_tick = tokio::time::interval(PEX_TICK);
        let mut checkpoint_tick = tokio::time::interval(CHECKPOINT_TICK);
        let mut events = self.events.subscribe();

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => self.handle_event(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = announce_tick.tick() => {
                    if matches!(self.state, TorrentState::Downloading | TorrentState::Seeding) {
                        self.announce(AnnounceEvent::None).await;
                    }
                }
                _ = choke_tick.tick() => {
                    if self.ctx.is_some() {
                        self.run_choke_algorithm().await;
                    }
                }
                _ = pex_tick.tick() => {
                    if self.conf.enable_pex {
                        self.broadcast_pex().await;
                    }
                }
                _ = checkpoint_tick.tick() => {
                    if let Err(e) = self.save_checkpoint().await {
                        self.events.emit(Event::CheckpointFailed {
                            info_hash: self.info_hash,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        let _ = self.save_checkpoint().await;
        for peer in self.peers.values() {
            let _ = peer.sender.send(peer::Command::Shutdown);
        }
        if let Some(tracker) = self.trackers.first_mut() {
            self.announce_one(tracker, AnnounceEvent::Stopped).await.ok();
        }
        self.events.emit(Event::TorrentRemoved { info_hash: self.info_hash });
    }

    /// Builds storage, the piece manager and the shared context, resumes
    /// from a checkpoint if one exists, and kicks off the first announce.
    /// For a magnet-only source, defers all of this until metadata has
    /// been fetched (see [`Self::connect_for_metadata`]).
    async fn setup(&mut self) -> Result<()> {
        match std::mem::replace(
            &mut self.source,
            TorrentSource::Magnet { info_hash: self.info_hash, trackers: Vec::new() },
        ) {
            TorrentSource::Metainfo(metainfo, raw) => {
                self.trackers = self.build_trackers(&metainfo);
                self.name = Some(metainfo.info.name.clone());
                let info_bytes = crate::bencode::raw_field_span(&raw, b"info")
                    .ok()
                    .flatten()
                    .map(|s| s.to_vec());
                self.init_from_metainfo(metainfo, info_bytes).await?;
                self.state = TorrentState::Downloading;
                self.announce(AnnounceEvent::Started).await;
            }
            TorrentSource::Magnet { info_hash, trackers } => {
                self.trackers = trackers
                    .iter()
                    .filter_map(|url| Tracker::new(url).ok())
                    .map(TrackerSession::new)
                    .collect();
                self.state = TorrentState::AcquiringMetadata;
                // Peer sessions run their own metadata exchange as soon as
                // they connect and report success on the event bus; see
                // `handle_event`'s `Event::MetadataComplete` arm.
                self.connect_for_metadata(info_hash).await;
            }
        }
        Ok(())
    }

    fn build_trackers(&self, metainfo: &Metainfo) -> Vec<TrackerSession> {
        let mut urls: Vec<String> = Vec::new();
        if let Some(tiers) = &metainfo.announce_list {
            for tier in tiers {
                urls.extend(tier.iter().cloned());
            }
        }
        if let Some(url) = &metainfo.announce {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls.into_iter()
            .filter_map(|url| Tracker::new(&url).ok())
            .map(TrackerSession::new)
            .collect()
    }

    async fn init_from_metainfo(&mut self, metainfo: Metainfo, info_bytes: Option<Vec<u8>>) -> Result<()> {
        let storage = StorageInfo::new(&metainfo, self.conf.download_dir.clone());
        self.preallocate(&storage).await?;

        let piece_hashes: Vec<Sha1Hash> = (0..metainfo.piece_count())
            .map(|i| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(metainfo.piece_hash(i).expect("piece index in range"));
                hash
            })
            .collect();
        let mut piece_manager = PieceManager::new(
            piece_hashes,
            storage.piece_len,
            storage.last_piece_len,
            self.conf.endgame_block_threshold,
        );

        if let Some(checkpoint) = self.checkpoints.load(&self.info_hash).await.ok().flatten() {
            let validation = self.checkpoints.validate(&checkpoint).await;
            if validation.is_ok() {
                piece_manager.restore_from_checkpoint(&checkpoint.verified_pieces);
                self.uploaded = checkpoint.uploaded;
            } else {
                log::warn!(
                    "torrent {} checkpoint failed validation, starting fresh: {:?}",
                    self.id,
                    validation
                );
            }
        }

        let piece_count = metainfo.piece_count();
        self.ctx = Some(Arc::new(SharedTorrentContext {
            id: self.id,
            info_hash: self.info_hash,
            client_id: self.client_id,
            piece_count,
            piece_manager: RwLock::new(piece_manager),
            storage,
            disk: self.disk.clone(),
            events: self.events.clone(),
            metainfo_bytes: RwLock::new(info_bytes),
        }));

        if self.conf.enable_dht {
            if let Some(dht) = &self.dht {
                let _ = dht.announce(self.info_hash, 0).await;
            }
        }

        Ok(())
    }

    async fn preallocate(&self, storage: &StorageInfo) -> Result<()> {
        match &storage.structure {
            crate::storage_info::FsStructure::File(file) => {
                let path = storage.download_dir.join(&file.path);
                self.disk.preallocate(path, file.len).await.map_err(Error::from)?;
            }
            crate::storage_info::FsStructure::Archive { files } => {
                for file in files {
                    let path = storage.download_dir.join(&file.path);
                    self.disk.preallocate(path, file.len).await.map_err(Error::from)?;
                }
            }
        }
        Ok(())
    }

    /// Connects to a handful of peers (from DHT, if enabled) purely to
    /// run the extension handshake and `ut_metadata` exchange; the
    /// shared context these peer sessions need doesn't exist yet, so
    /// they're given a placeholder one with an empty piece layout.
    async fn connect_for_metadata(&mut self, info_hash: Sha1Hash) {
        let placeholder_storage = StorageInfo {
            piece_count: 0,
            piece_len: 0,
            last_piece_len: 0,
            download_len: 0,
            download_dir: self.conf.download_dir.clone(),
            structure: crate::storage_info::FsStructure::Archive { files: Vec::new() },
        };
        self.ctx = Some(Arc::new(SharedTorrentContext {
            id: self.id,
            info_hash,
            client_id: self.client_id,
            piece_count: 0,
            piece_manager: RwLock::new(PieceManager::new(Vec::new(), 1, 1, 0)),
            storage: placeholder_storage,
            disk: self.disk.clone(),
            events: self.events.clone(),
            metainfo_bytes: RwLock::new(None),
        }));

        let mut addrs = Vec::new();
        if let Some(dht) = &self.dht {
            if let Ok(found) = dht.find_peers(info_hash).await {
                addrs = found;
            }
        }
        for addr in addrs {
            self.connect_peer(addr);
        }
    }

    /// Called from [`Self::handle_event`] once a peer session reports a
    /// verified `info` dictionary for this torrent's info hash, so we can
    /// finish setup.
    async fn complete_metadata(&mut self, info: Vec<u8>) -> Result<()> {
        if !matches!(self.state, TorrentState::AcquiringMetadata) {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(info.len() + 16);
        buf.extend_from_slice(b"d4:info");
        buf.extend_from_slice(&info);
        buf.extend_from_slice(b"e");
        let metainfo = Metainfo::from_bytes(&buf).map_err(Error::from)?;

        for peer in self.peers.values() {
            let _ = peer.sender.send(peer::Command::Shutdown);
        }
        self.peers.clear();

        self.trackers = self.build_trackers(&metainfo);
        self.name = Some(metainfo.info.name.clone());
        self.init_from_metainfo(metainfo, Some(info)).await?;
        self.state = TorrentState::Downloading;
        self.announce(AnnounceEvent::Started).await;
        Ok(())
    }

    /// Reacts to events this torrent cares about from the crate-wide bus:
    /// its own metadata finishing (reported by whichever peer session
    /// assembled it) and peers learned through another peer's PEX
    /// exchange.
    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::MetadataComplete { info_hash, info } if info_hash == self.info_hash => {
                if let Err(e) = self.complete_metadata(info).await {
                    log::error!("torrent {} failed to apply fetched metadata: {}", self.id, e);
                }
            }
            Event::PexPeersReceived { info_hash, peers } if info_hash == self.info_hash => {
                for addr in peers {
                    self.connect_peer(addr);
                }
            }
            _ => {}
        }
    }

    fn connect_peer(&mut self, addr: SocketAddr) {
        if self.peers.contains_key(&addr) {
            return;
        }
        let ctx = match &self.ctx {
            Some(ctx) => ctx.clone(),
            None => return,
        };
        let (mut session, sender) = PeerSession::outbound(ctx, addr);
        let events = self.events.clone();
        let info_hash = self.info_hash;
        tokio::spawn(async move {
            if let Err(e) = session.start().await {
                log::debug!("peer session {} ended: {}", addr, e);
            }
            events.emit(Event::PeerDisconnected { info_hash, peer: addr, reason: "closed".into() });
        });
        self.events.emit(Event::PeerConnected { info_hash: self.info_hash, peer: addr });
        self.peers.insert(addr, ConnectedPeer { sender, is_seed: false });
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Pause => {
                self.state = TorrentState::Paused;
                for peer in self.peers.values() {
                    let _ = peer.sender.send(peer::Command::Shutdown);
                }
                self.peers.clear();
            }
            Command::Resume => {
                if matches!(self.state, TorrentState::Paused) {
                    self.state = TorrentState::Downloading;
                    self.announce(AnnounceEvent::None).await;
                }
            }
            Command::Stop => return false,
            Command::ForceAnnounce => {
                self.announce(AnnounceEvent::None).await;
            }
            Command::GetStatus(reply) => {
                let _ = reply.send(self.status().await);
            }
            Command::Checkpoint(reply) => {
                let result = self.save_checkpoint().await;
                let _ = reply.send(result);
            }
        }
        true
    }

    async fn status(&self) -> TorrentStatus {
        let (verified, total, downloaded, download_rate, upload_rate) = match &self.ctx {
            Some(ctx) => {
                let manager = ctx.piece_manager.read().await;
                let (verified, total) = manager.progress();
                let downloaded = verified as u64 * ctx.storage.piece_len as u64;
                (verified, total, downloaded, 0, 0)
            }
            None => (0, 0, 0, 0, 0),
        };
        TorrentStatus {
            id: self.id,
            info_hash: self.info_hash,
            name: self.name.clone(),
            state: self.state.clone(),
            verified_pieces: verified,
            piece_count: total,
            downloaded,
            uploaded: self.uploaded,
            total_len: self.ctx.as_ref().map(|c| c.storage.download_len).unwrap_or(0),
            peer_count: self.peers.len(),
            download_rate,
            upload_rate,
        }
    }

    async fn announce_one(&mut self, tracker: &mut TrackerSession, event: AnnounceEvent) -> Result<()> {
        let (downloaded, left) = match &self.ctx {
            Some(ctx) => {
                let manager = ctx.piece_manager.read().await;
                let (verified, _) = manager.progress();
                let downloaded = verified as u64 * ctx.storage.piece_len as u64;
                (downloaded, ctx.storage.download_len.saturating_sub(downloaded))
            }
            None => (0, 0),
        };
        let req = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.client_id,
            port: 0,
            uploaded: self.uploaded,
            downloaded,
            left,
            event,
            numwant: self.conf.min_requested_peer_count as u32,
        };
        let url = tracker.url().to_string();
        match tracker.announce(&req).await {
            Ok(resp) => {
                self.events.emit(Event::TrackerAnnouncement {
                    info_hash: self.info_hash,
                    url,
                    ok: true,
                    interval: Some(resp.interval.as_secs()),
                    error: None,
                });
                for addr in resp.peers {
                    self.connect_peer(addr);
                }
                Ok(())
            }
            Err(e) => {
                self.events.emit(Event::TrackerAnnouncement {
                    info_hash: self.info_hash,
                    url,
                    ok: false,
                    interval: None,
                    error: Some(e.to_string()),
                });
                Err(Error::from(e))
            }
        }
    }

    async fn announce(&mut self, event: AnnounceEvent) {
        if self.peers.len() >= self.conf.max_connected_peer_count {
            return;
        }
        let mut trackers = std::mem::take(&mut self.trackers);
        for tracker in trackers.iter_mut() {
            // A tracker that's still serving a backoff period from a
            // prior failure is skipped this round rather than retried;
            // `Stopped` announces on shutdown bypass backoff since
            // they're best-effort and never retried anyway.
            if tracker.is_backing_off() && event != AnnounceEvent::Stopped {
                continue;
            }
            let _ = self.announce_one(tracker, event).await;
        }
        self.trackers = trackers;

        if self.conf.enable_dht {
            if let Some(dht) = &self.dht {
                if let Ok(addrs) = dht.find_peers(self.info_hash).await {
                    self.events.emit(Event::DhtPeersFound {
                        info_hash: self.info_hash,
                        count: addrs.len(),
                    });
                    for addr in addrs {
                        self.connect_peer(addr);
                    }
                }
            }
        }
    }

    /// Top-K-by-download-rate-plus-one-optimistic-slot unchoke policy,
    /// per `peer::Command::SetChoked`'s doc comment deferring this here.
    async fn run_choke_algorithm(&mut self) {
        self.choke_round = self.choke_round.wrapping_add(1);

        let mut stats = Vec::new();
        for (addr, peer) in &self.peers {
            let (tx, rx) = oneshot::channel();
            if peer.sender.send(peer::Command::GetStats(tx)).is_ok() {
                if let Ok(s) = rx.await {
                    stats.push((*addr, s));
                }
            }
        }

        let interested: Vec<&(SocketAddr, PeerStats)> =
            stats.iter().filter(|(_, s)| s.is_peer_interested).collect();
        let mut ranked = interested.clone();
        ranked.sort_by(|a, b| b.1.download_rate.cmp(&a.1.download_rate));

        let mut unchoke: HashSet<SocketAddr> =
            ranked.iter().take(UNCHOKE_SLOT_COUNT).map(|(addr, _)| *addr).collect();

        if self.choke_round % OPTIMISTIC_UNCHOKE_EVERY == 0 {
            if let Some((addr, _)) = interested
                .iter()
                .find(|(addr, _)| !unchoke.contains(addr))
            {
                unchoke.insert(*addr);
            }
        }

        for (addr, peer) in &self.peers {
            let choked = !unchoke.contains(addr);
            let _ = peer.sender.send(peer::Command::SetChoked(choked));
        }
    }

    async fn broadcast_pex(&mut self) {
        let current: HashSet<SocketAddr> = self.peers.keys().copied().collect();
        let seeds: HashSet<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_seed)
            .map(|(addr, _)| *addr)
            .collect();
        for peer in self.peers.values() {
            let _ = peer.sender.send(peer::Command::SendPex {
                current: current.clone(),
                seeds: seeds.clone(),
            });
        }
    }

    async fn save_checkpoint(&self) -> std::result::Result<(), CheckpointError> {
        let ctx = match &self.ctx {
            Some(ctx) => ctx,
            None => return Ok(()),
        };
        let manager = ctx.piece_manager.read().await;
        let verified_pieces: Vec<usize> = manager
            .bitmap()
            .into_iter()
            .enumerate()
            .filter_map(|(i, has)| if has { Some(i) } else { None })
            .collect();
        drop(manager);

        let files = match &ctx.storage.structure {
            crate::storage_info::FsStructure::File(file) => {
                vec![FileCheckpoint { path: ctx.storage.download_dir.join(&file.path), len: file.len }]
            }
            crate::storage_info::FsStructure::Archive { files } => files
                .iter()
                .map(|f| FileCheckpoint {
                    path: ctx.storage.download_dir.join(&f.path),
                    len: f.len,
                })
                .collect(),
        };

        let mut checkpoint = Checkpoint::new(self.info_hash);
        checkpoint.verified_pieces = verified_pieces;
        checkpoint.uploaded = self.uploaded;
        checkpoint.files = files;

        self.checkpoints.save(&checkpoint).await?;
        self.events.emit(Event::CheckpointSaved {
            info_hash: self.info_hash,
            ts: SystemTime::now(),
        });
        Ok(())
    }
}
