//! A single peer connection: handshake, optional extension handshake,
//! and the steady-state duplex exchange of interest, choke, request and
//! block messages.
//!
//! Generalizes the original single-peer, download-only `PeerSession`
//! into a session that can also serve blocks to interested peers,
//! survive against many concurrent peers sharing one
//! [`crate::piece_manager::PieceManager`], and bridge the extension
//! protocol for magnet metadata exchange. The `select!`-over-socket-and-
//! command-port loop, and the handshake-then-codec-swap dance via
//! `Framed`/`FramedParts`, are unchanged.

use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::{Duration, Instant}};

use futures::{
    select,
    stream::{Fuse, SplitSink},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::interval,
};
use tokio_util::codec::{Framed, FramedParts};

use super::{
    codec::{Handshake, HandshakeCodec, Message, PeerCodec, PROTOCOL_STRING},
    extension::{ExtensionHandshake, MetadataAssembler, MetadataMessage},
    state::State,
};
use crate::pex::{PexMessage, PexState};
use sha1::{Digest, Sha1};

use crate::{
    counter::ThroughputCounter,
    error::{Error, PeerError, Result},
    piece_manager::BlockOutcome,
    torrent::SharedTorrentContext,
    Bitfield, BlockInfo, PeerId, Sha1Hash,
};

fn sha1_matches(data: &[u8], expected: Sha1Hash) -> bool {
    let digest = Sha1::digest(data);
    digest.as_slice() == expected
}

/// The maximum number of block requests we keep outstanding to a single
/// peer. Starts at a fixed optimistic value of 4; later ramped by
/// `adjust_request_queue_len` based on observed throughput.
const INITIAL_REQUEST_QUEUE_LEN: usize = 4;
const MAX_REQUEST_QUEUE_LEN: usize = 64;

/// How long we wait for a block after requesting it before giving up on
/// it and freeing it for another peer (or another request to this peer).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The channel on which the owning torrent session can send this peer
/// session a command.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// Commands a torrent session sends down into one of its peer sessions.
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
    /// Choke or unchoke this peer, per the owning torrent's choke
    /// algorithm (§4.5's top-K-by-rate-plus-optimistic-rotation policy
    /// lives in `torrent::session`, not here).
    SetChoked(bool),
    /// Reports this session's current rates and interest state, polled
    /// by the torrent session's choke algorithm to rank peers.
    GetStats(oneshot::Sender<PeerStats>),
    /// The torrent session's current known peer set changed; send this
    /// peer the delta since we last told it, if it supports `ut_pex`.
    SendPex {
        current: HashSet<SocketAddr>,
        seeds: HashSet<SocketAddr>,
    },
}

/// A snapshot of one peer session's throughput and interest state, as
/// seen by the owning torrent session's choke algorithm.
pub(crate) struct PeerStats {
    pub addr: SocketAddr,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub is_peer_interested: bool,
    pub is_choked: bool,
}

/// Information about the peer we're connected to, set after a successful
/// handshake.
struct PeerInfo {
    peer_id: PeerId,
    pieces: Bitfield,
}

pub(crate) struct PeerSession {
    ctx: Arc<SharedTorrentContext>,
    cmd_port: Fuse<Receiver>,
    addr: SocketAddr,
    state: State,
    is_choked: bool,
    is_interested: bool,
    is_peer_choked: bool,
    is_peer_interested: bool,
    /// Requests we've sent to the peer and are waiting to be served,
    /// along with when each was sent (for timeout detection).
    outgoing_requests: Vec<(BlockInfo, Instant)>,
    /// Requests the peer has sent us that we haven't served yet (only
    /// populated while the peer is unchoked by us).
    peer_requests: Vec<BlockInfo>,
    peer_info: Option<PeerInfo>,
    extension: Option<ExtensionHandshake>,
    metadata_assembler: Option<MetadataAssembler>,
    download_rate: ThroughputCounter,
    upload_rate: ThroughputCounter,
    best_request_queue_len: usize,
    pex_state: PexState,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    pub fn outbound(ctx: Arc<SharedTorrentContext>, addr: SocketAddr) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                ctx,
                cmd_port: cmd_port.fuse(),
                addr,
                state: State::default(),
                is_choked: true,
                is_interested: false,
                is_peer_choked: true,
                is_peer_interested: false,
                outgoing_requests: Vec::new(),
                peer_requests: Vec::new(),
                peer_info: None,
                extension: None,
                metadata_assembler: None,
                download_rate: ThroughputCounter::new(),
                upload_rate: ThroughputCounter::new(),
                best_request_queue_len: INITIAL_REQUEST_QUEUE_LEN,
                pex_state: PexState::default(),
            },
            cmd_chan,
        )
    }

    /// Starts the peer session and returns once the connection is closed
    /// or an unrecoverable error occurs.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting peer {} session", self.addr);

        self.state = State::Connecting;
        let socket = TcpStream::connect(self.addr).await.map_err(PeerError::Io)?;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        self.state = State::Handshaking;
        let handshake = Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        let we_support_extensions = handshake.supports_extension_protocol();
        socket.send(handshake.clone()).await.map_err(Error::from)?;

        let peer_handshake = match socket.next().await {
            Some(h) => h.map_err(Error::from)?,
            None => {
                log::info!("Peer {} closed connection during handshake", self.addr);
                return Ok(());
            }
        };
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

        if peer_handshake.info_hash != self.ctx.info_hash {
            log::warn!("Peer {} sent mismatching info hash", self.addr);
            return Err(Error::from(PeerError::InvalidPeerInfoHash));
        }

        self.peer_info = Some(PeerInfo {
            peer_id: peer_handshake.peer_id,
            pieces: Bitfield::repeat(false, self.ctx.piece_count),
        });

        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut socket = Framed::from_parts(new_parts);

        if we_support_extensions && peer_handshake.supports_extension_protocol() {
            self.state = State::ExtHandshaking;
            let metadata_size = self
                .ctx
                .metainfo_bytes
                .read()
                .await
                .as_ref()
                .map(|b| b.len() as u32);
            let ours = ExtensionHandshake::ours(metadata_size);
            socket
                .send(Message::Extended { id: 0, payload: ours.encode() })
                .await
                .map_err(Error::from)?;
        }

        self.state = State::AvailabilityExchange;
        log::info!("Peer {} session state: {:?}", self.addr, self.state);

        self.run(socket).await
    }

    /// Runs the session after the connection is established: the main
    /// select loop over incoming peer messages, commands from the
    /// torrent session, and a periodic tick for timeouts/keepalives.
    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();
        let mut tick = interval(Duration::from_secs(10));

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg.map_err(Error::from)?;
                    self.dispatch(&mut sink, msg).await?;
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Shutdown => {
                            log::info!("Shutting down peer {} session", self.addr);
                            self.state = State::Disconnecting;
                            break;
                        }
                        Command::SetChoked(choked) => {
                            self.set_peer_choked(&mut sink, choked).await?;
                        }
                        Command::GetStats(reply) => {
                            let _ = reply.send(PeerStats {
                                addr: self.addr,
                                download_rate: self.download_rate.rate(),
                                upload_rate: self.upload_rate.rate(),
                                is_peer_interested: self.is_peer_interested,
                                is_choked: self.is_choked,
                            });
                        }
                        Command::SendPex { current, seeds } => {
                            self.send_pex(&mut sink, &current, &seeds).await?;
                        }
                    }
                }
                _ = tick.tick().fuse() => {
                    self.on_tick(&mut sink).await?;
                }
            }
        }

        self.ctx.piece_manager.write().await.on_peer_gone(self.local_peer_id());

        Ok(())
    }

    fn local_peer_id(&self) -> PeerId {
        // The peer id we use to key in-flight requests is our own client
        // id scoped to this connection's remote address isn't unique
        // enough across reconnects, so derive a stable per-session key
        // from the handshake peer id we received.
        self.peer_info
            .as_ref()
            .map(|i| i.peer_id)
            .unwrap_or(self.ctx.client_id)
    }

    async fn dispatch(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        log::debug!("Received message {:?} from peer {}", msg.id(), self.addr);

        if self.state == State::AvailabilityExchange {
            match msg {
                Message::Bitfield(bitfield) => {
                    self.handle_bitfield_msg(sink, bitfield).await?;
                    self.state = State::Connected;
                    return Ok(());
                }
                Message::Extended { .. } | Message::Have { .. } => {
                    // a leech may send nothing but `Have`s, or delay the
                    // extension handshake reply; handle them here and
                    // stay in this state until something else arrives
                }
                _ => {
                    self.state = State::Connected;
                }
            }
        }

        self.handle_msg(sink, msg).await
    }

    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        log::info!("Handling peer {} bitfield message", self.addr);
        bitfield.resize(self.ctx.piece_count, false);

        let interested = self
            .ctx
            .piece_manager
            .write()
            .await
            .set_peer_bitfield(&bitfield)
            .map_err(Error::from)?;

        if let Some(info) = &mut self.peer_info {
            info.pieces = bitfield;
        }

        self.is_interested = interested;
        if interested {
            sink.send(Message::Interested).await.map_err(Error::from)?;
        }
        Ok(())
    }

    async fn handle_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) => {
                return Err(Error::from(PeerError::BitfieldNotAfterHandshake));
            }
            Message::KeepAlive => {}
            Message::Choke => {
                if !self.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.is_choked = true;
                    let freed: Vec<BlockInfo> =
                        self.outgoing_requests.drain(..).map(|(b, _)| b).collect();
                    let mut manager = self.ctx.piece_manager.write().await;
                    for block in freed {
                        manager.on_block_cancelled_by_timeout(block, self.local_peer_id());
                    }
                }
            }
            Message::Unchoke => {
                if self.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.is_choked = false;
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                self.is_peer_interested = true;
            }
            Message::NotInterested => {
                self.is_peer_interested = false;
            }
            Message::Have { piece_index } => {
                if let Some(info) = &mut self.peer_info {
                    if piece_index < info.pieces.len() {
                        info.pieces.set(piece_index, true);
                    }
                }
                let became_interesting =
                    self.ctx.piece_manager.write().await.on_have(piece_index);
                if became_interesting && !self.is_interested {
                    self.is_interested = true;
                    sink.send(Message::Interested).await.map_err(Error::from)?;
                }
            }
            Message::Request(info) => {
                if !self.is_peer_choked {
                    self.peer_requests.push(info);
                    self.serve_requests(sink).await?;
                } else {
                    log::debug!(
                        "Ignoring request from choked peer {}: {:?}",
                        self.addr,
                        info
                    );
                }
            }
            Message::Block { piece_index, offset, data } => {
                let info = BlockInfo { piece_index, offset, len: data.len() as u32 };
                self.handle_block_msg(info, data).await?;
                self.make_requests(sink).await?;
            }
            Message::Cancel(info) => {
                self.peer_requests.retain(|r| *r != info);
            }
            Message::Port(_) => {
                // DHT node port advertisement; the torrent session (which
                // owns the DHT client) is notified out of band via the
                // shared context rather than threaded through here.
            }
            Message::Extended { id, payload } => {
                self.handle_extended_msg(sink, id, payload).await?;
            }
        }
        Ok(())
    }

    async fn handle_extended_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        id: u8,
        payload: Vec<u8>,
    ) -> Result<()> {
        if id == 0 {
            let handshake = ExtensionHandshake::decode(&payload).map_err(Error::from)?;
            log::info!("Peer {} extension handshake: {:?}", self.addr, handshake.client_version);
            self.extension = Some(handshake);
            return Ok(());
        }

        let ut_metadata_id = self.extension.as_ref().and_then(|e| e.ut_metadata_id());
        if Some(id) == ut_metadata_id {
            let msg = MetadataMessage::decode(&payload).map_err(Error::from)?;
            match msg {
                MetadataMessage::Request { piece } => {
                    let our_metadata = self.ctx.metainfo_bytes.read().await.clone();
                    let reply_payload = match our_metadata {
                        Some(info) if (piece as usize) * super::extension::METADATA_PIECE_LEN < info.len() => {
                            let start = piece as usize * super::extension::METADATA_PIECE_LEN;
                            let end = (start + super::extension::METADATA_PIECE_LEN).min(info.len());
                            MetadataMessage::Data {
                                piece,
                                total_size: info.len() as u32,
                                data: info[start..end].to_vec(),
                            }
                        }
                        _ => MetadataMessage::Reject { piece },
                    };
                    let reply = Message::Extended { id, payload: reply_payload.encode() };
                    sink.send(reply).await.map_err(Error::from)?;
                }
                MetadataMessage::Data { piece, total_size, data } => {
                    let assembler = self
                        .metadata_assembler
                        .get_or_insert_with(|| MetadataAssembler::new(total_size));
                    assembler.insert(piece, data);
                    if assembler.is_complete() {
                        let info = assembler.assemble();
                        if sha1_matches(&info, self.ctx.info_hash) {
                            self.ctx.events.emit(crate::event::Event::MetadataComplete {
                                info_hash: self.ctx.info_hash,
                                info,
                            });
                        } else {
                            log::warn!(
                                "Peer {} sent metadata that doesn't hash to the expected info hash",
                                self.addr
                            );
                            self.metadata_assembler = None;
                        }
                    }
                }
                MetadataMessage::Reject { piece } => {
                    log::warn!("Peer {} rejected metadata piece {}", self.addr, piece);
                }
            }
            return Ok(());
        }

        let ut_pex_id = self.extension.as_ref().and_then(|e| e.ut_pex_id());
        if Some(id) == ut_pex_id {
            let msg = PexMessage::decode(&payload).map_err(Error::from)?;
            if !msg.added.is_empty() {
                self.ctx.events.emit(crate::event::Event::PexPeersReceived {
                    info_hash: self.ctx.info_hash,
                    peers: msg.added,
                });
            }
        }
        Ok(())
    }

    /// Sends this peer the delta of the torrent's current known peer set
    /// against what we've already told it, if it negotiated `ut_pex`.
    async fn send_pex(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        current: &HashSet<SocketAddr>,
        seeds: &HashSet<SocketAddr>,
    ) -> Result<()> {
        let id = match self.extension.as_ref().and_then(|e| e.ut_pex_id()) {
            Some(id) => id,
            None => return Ok(()),
        };
        let msg = self.pex_state.diff(current, seeds);
        if msg.added.is_empty() && msg.dropped.is_empty() {
            return Ok(());
        }
        sink.send(Message::Extended { id, payload: msg.encode() })
            .await
            .map_err(Error::from)
    }

    /// Fills the outgoing request pipeline up to `best_request_queue_len`.
    async fn make_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if self.is_choked || !self.is_interested {
            return Ok(());
        }
        let peer_bitfield = match &self.peer_info {
            Some(info) => info.pieces.clone(),
            None => return Ok(()),
        };

        let mut requests = Vec::new();
        while self.outgoing_requests.len() + requests.len() < self.best_request_queue_len {
            let mut manager = self.ctx.piece_manager.write().await;
            match manager.next_request(self.local_peer_id(), &peer_bitfield) {
                Some(block) => requests.push(block),
                None => break,
            }
        }

        let now = Instant::now();
        for block in &requests {
            sink.send(Message::Request(*block)).await.map_err(Error::from)?;
            self.outgoing_requests.push((*block, now));
        }
        Ok(())
    }

    async fn handle_block_msg(&mut self, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        self.outgoing_requests.retain(|(b, _)| *b != info);
        self.download_rate.update(data.len() as u64);

        let outcome = self
            .ctx
            .piece_manager
            .write()
            .await
            .on_block_received(info, data.clone(), self.local_peer_id());

        match outcome {
            BlockOutcome::Stored => {}
            BlockOutcome::PieceVerified(piece) => {
                self.ctx.events.emit(crate::event::Event::PieceVerified {
                    info_hash: self.ctx.info_hash,
                    index: piece.index,
                });
                self.write_piece(piece).await?;
            }
            BlockOutcome::PieceFailed { index, offending_peers } => {
                log::warn!("Piece {} failed hash check", index);
                self.ctx.events.emit(crate::event::Event::PieceFailed {
                    info_hash: self.ctx.info_hash,
                    index,
                    offending_peers,
                });
            }
            BlockOutcome::Rejected => {
                log::debug!("Peer {} sent an unrequested or malformed block", self.addr);
            }
        }
        Ok(())
    }

    /// Splits a verified piece across the file(s) it overlaps and writes
    /// each file segment through the shared disk handle.
    async fn write_piece(&self, piece: crate::piece_manager::CompletedPiece) -> Result<()> {
        let concatenated: Vec<u8> = piece.blocks.into_iter().flatten().collect();
        let piece_offset = piece.index as u64 * self.ctx.storage.piece_len as u64;
        let files = self
            .ctx
            .storage
            .files_intersecting_piece(piece.index)
            .map_err(Error::from)?;

        let mut cursor = 0usize;
        for file_index in files {
            let file_info = self.ctx.storage.file_info(file_index);
            let slice = file_info.get_slice(piece_offset + cursor as u64, concatenated.len() - cursor);
            let end = cursor + slice.len as usize;
            self.ctx
                .disk
                .write_block(file_info.path.clone(), slice.offset, concatenated[cursor..end].to_vec())
                .await
                .map_err(Error::from)?;
            cursor = end;
        }
        Ok(())
    }

    /// Serves any of the peer's pending requests we're not choking.
    async fn serve_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        let requests = std::mem::take(&mut self.peer_requests);
        for info in requests {
            let files = self
                .ctx
                .storage
                .files_intersecting_piece(info.piece_index)
                .map_err(Error::from)?;
            let file_index = match files.clone().next() {
                Some(i) => i,
                None => continue,
            };
            let file_info = self.ctx.storage.file_info(file_index);
            let piece_offset = info.piece_index as u64 * self.ctx.storage.piece_len as u64;
            let data = self
                .ctx
                .disk
                .read_block(file_info.path.clone(), piece_offset + info.offset as u64, info.len)
                .await
                .map_err(Error::from)?;
            self.upload_rate.update(data.len() as u64);
            sink.send(Message::Block {
                piece_index: info.piece_index,
                offset: info.offset,
                data,
            })
            .await
            .map_err(Error::from)?;
        }
        Ok(())
    }

    async fn set_peer_choked(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        choked: bool,
    ) -> Result<()> {
        if self.is_peer_choked != choked {
            self.is_peer_choked = choked;
            let msg = if choked { Message::Choke } else { Message::Unchoke };
            sink.send(msg).await.map_err(Error::from)?;
            if !choked {
                self.serve_requests(sink).await?;
            }
        }
        Ok(())
    }

    /// Periodic housekeeping: times out stale requests and widens the
    /// request queue while the link keeps up with it, a simple analogue
    /// of TCP slow start.
    async fn on_tick(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        let now = Instant::now();
        let mut timed_out = Vec::new();
        self.outgoing_requests.retain(|(block, requested_at)| {
            if now.duration_since(*requested_at) >= REQUEST_TIMEOUT {
                timed_out.push(*block);
                false
            } else {
                true
            }
        });
        if !timed_out.is_empty() {
            let mut manager = self.ctx.piece_manager.write().await;
            for block in timed_out {
                manager.on_block_cancelled_by_timeout(block, self.local_peer_id());
            }
        }

        if self.download_rate.rate() > 0 && self.best_request_queue_len < MAX_REQUEST_QUEUE_LEN {
            self.best_request_queue_len += 1;
        }

        if self.outgoing_requests.is_empty() {
            sink.send(Message::KeepAlive).await.map_err(Error::from)?;
        } else {
            self.make_requests(sink).await?;
        }
        Ok(())
    }
}
