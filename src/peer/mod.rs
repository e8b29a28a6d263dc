//! A single peer connection: handshake, availability exchange, choke/
//! interest signalling, block request pipelining and serving, and rate
//! metering (§4.4 PeerSession).
//!
//! The teacher's `peer::PeerSession` only ever drove a download from a
//! single, pre-verified seed and kept its own `download::PieceDownload`
//! bookkeeping per session. Since pieces are now requested from, and
//! contributed by, more than one peer at once (endgame mode, §4.5) and
//! this session also serves blocks back to peers that are interested in
//! us, the request/download bookkeeping moved out to [`crate::piece_db`]
//! and [`crate::piece_picker`], shared behind `tokio::sync::RwLock`s owned
//! by the torrent actor (§4.6), and this module shrinks to the state
//! machine that drives one socket.

mod codec;
pub(crate) mod error;

pub(crate) use error::*;

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{select, stream::Fuse, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, RwLock},
    time,
};
use tokio_util::codec::{Framed, FramedParts};

use self::codec::{Handshake, HandshakeCodec, Message, PeerCodec, PROTOCOL_STRING};
use crate::{
    conf::TorrentConf,
    disk::DiskHandle,
    piece_db::PieceDb,
    piece_picker::{PiecePicker, PieceSelector},
    torrent::{PeerEvent, PeerStatusMap, PeerStatusSnapshot, SharedStatus},
    counter::ThroughputCounter,
    BlockInfo, PeerId, PieceIndex,
};

/// A peer session's lifecycle (§4.4). Unlike the teacher's finer-grained
/// `Disconnected/Connecting/Handshaking/AvailabilityExchange/Connected`
/// sequence, the socket connect and handshake steps are folded into the
/// single `AwaitingHandshake` phase since nothing else in the torrent
/// needs to observe them separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHandshake,
    Established,
    Closed,
}

/// The four choke/interest flags a session tracks in both directions
/// (§3). A fresh connection starts choking and uninterested both ways,
/// per the reference unchoke algorithm.
#[derive(Debug, Clone, Copy)]
struct Status {
    state: State,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::AwaitingHandshake,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Commands the torrent actor posts to a running peer session.
pub(crate) enum Command {
    /// Starts or stops choking the peer.
    Choke(bool),
    /// Announces that we now have `PieceIndex` (§4.4 "Have broadcast").
    Have(PieceIndex),
    /// Nudges the session to top up its request pipeline again, e.g.
    /// because a piece it had fully downloaded failed validation and
    /// became requestable again. A no-op if we're choked or uninterested.
    FillPipeline,
    /// Delivers a block read back from disk in response to an earlier
    /// `Request`, to be sent on as a `Message::Block`.
    SendBlock(BlockInfo, Vec<u8>),
    /// Tears down the session.
    Shutdown,
}

pub(crate) type Sender = mpsc::UnboundedSender<Command>;
pub(crate) type Receiver = mpsc::UnboundedReceiver<Command>;

type Sink = futures::stream::SplitSink<Framed<TcpStream, PeerCodec>, Message>;

/// Drives a single peer connection from handshake to close.
pub(crate) struct PeerSession {
    torrent: Arc<SharedStatus>,
    conf: Arc<TorrentConf>,
    piece_db: Arc<RwLock<PieceDb>>,
    piece_picker: Arc<RwLock<PiecePicker>>,
    disk: DiskHandle,
    status_map: PeerStatusMap,
    torrent_events: mpsc::UnboundedSender<PeerEvent>,
    cmd_port: Fuse<Receiver>,
    ticker: Fuse<time::Interval>,

    addr: SocketAddr,
    peer_id: Option<PeerId>,
    status: Status,

    /// Blocks we have requested from the peer, keyed by their wire
    /// identity, with the instant the request was sent.
    outgoing: HashMap<BlockInfo, Instant>,
    /// Blocks the peer has requested from us and that we've forwarded to
    /// the torrent actor to serve, but haven't answered yet (used to
    /// honour `Cancel`, §4.4).
    incoming: HashSet<BlockInfo>,
    consecutive_timeouts: usize,
    /// True until the first post-handshake message arrives; a `Bitfield`
    /// received outside this window is a protocol violation (§7).
    expects_bitfield: bool,

    download_counter: ThroughputCounter,
    upload_counter: ThroughputCounter,
    ticks: u64,
}

impl PeerSession {
    /// Creates a session that will connect out to `addr` once [`Self::start`]
    /// is called, returning it along with the command sender the torrent
    /// actor uses to address it.
    #[allow(clippy::too_many_arguments)]
    pub fn outbound(
        torrent: Arc<SharedStatus>,
        conf: Arc<TorrentConf>,
        piece_db: Arc<RwLock<PieceDb>>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        disk: DiskHandle,
        status_map: PeerStatusMap,
        torrent_events: mpsc::UnboundedSender<PeerEvent>,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        let (cmd_tx, cmd_port) = mpsc::unbounded_channel();
        let session = Self {
            torrent,
            conf,
            piece_db,
            piece_picker,
            disk,
            status_map,
            torrent_events,
            cmd_port: cmd_port.fuse(),
            ticker: time::interval(Duration::from_secs(1)).fuse(),
            addr,
            peer_id: None,
            status: Status::default(),
            outgoing: HashMap::new(),
            incoming: HashSet::new(),
            consecutive_timeouts: 0,
            expects_bitfield: true,
            download_counter: ThroughputCounter::default(),
            upload_counter: ThroughputCounter::default(),
            ticks: 0,
        };
        (session, cmd_tx)
    }

    /// Connects, performs the handshake, and then drives the session
    /// until the connection closes or a protocol violation occurs.
    ///
    /// Whatever the outcome, the torrent actor always learns about it via
    /// a closing [`PeerEvent::Disconnected`] — including a failure to
    /// connect or complete the handshake at all — so it never leaks a
    /// peer-map entry for a session that never reached `Established`
    /// (§7 TransportFailure).
    pub async fn start(&mut self) -> Result<()> {
        let result = self.connect_and_run().await;
        self.status.state = State::Closed;
        self.teardown().await;
        let _ = self
            .torrent_events
            .send(PeerEvent::Disconnected { addr: self.addr });
        result
    }

    async fn connect_and_run(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        let socket = TcpStream::connect(self.addr).await?;
        log::info!("Connected to peer {}", self.addr);

        let mut handshake_socket = Framed::new(socket, HandshakeCodec);
        let handshake = Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        handshake_socket.send(handshake).await?;

        let peer_handshake = match handshake_socket.next().await {
            Some(handshake) => handshake?,
            None => return Err(PeerError::ConnectionClosed),
        };
        if &peer_handshake.prot[..] != PROTOCOL_STRING.as_bytes() {
            return Err(PeerError::InvalidProtocol);
        }
        if peer_handshake.info_hash != self.torrent.info_hash {
            return Err(PeerError::InvalidInfoHash);
        }

        log::info!("Handshake with {} complete", self.addr);
        self.peer_id = Some(peer_handshake.peer_id);
        self.status.state = State::Established;
        let _ = self.torrent_events.send(PeerEvent::Connected {
            addr: self.addr,
            peer_id: peer_handshake.peer_id,
        });

        // switch the framed socket's codec from the one-shot handshake
        // codec to the steady-state message codec without losing any
        // bytes the peer may have pipelined straight after its handshake.
        let old_parts = handshake_socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.run(socket).await
    }

    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // announce our current availability right after the handshake
        // (§4.4 "bitfield exchange").
        let bitfield = self.piece_db.read().await.bitfield();
        sink.send(Message::Bitfield(bitfield)).await?;

        loop {
            select! {
                msg = stream.select_next_some() => {
                    self.handle_message(&mut sink, msg?).await?;
                }
                cmd = self.cmd_port.select_next_some() => {
                    self.handle_command(&mut sink, cmd).await?;
                }
                _ = self.ticker.select_next_some() => {
                    self.on_tick(&mut sink).await?;
                }
            }
            if self.status.state == State::Closed {
                break;
            }
        }
        Ok(())
    }

    async fn handle_message(&mut self, sink: &mut Sink, msg: Message) -> Result<()> {
        log::trace!("Peer {} -> {:?}", self.addr, msg.id());
        let was_expecting_bitfield = self.expects_bitfield;
        self.expects_bitfield = false;

        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                if !self.status.peer_choking {
                    self.status.peer_choking = true;
                    self.giveback_all_outgoing().await;
                }
            }
            Message::Unchoke => {
                if self.status.peer_choking {
                    self.status.peer_choking = false;
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => self.status.peer_interested = true,
            Message::NotInterested => self.status.peer_interested = false,
            Message::Have { piece_index } => {
                if let Some(peer_id) = self.peer_id {
                    self.piece_picker
                        .write()
                        .await
                        .peer_have_piece(peer_id, piece_index);
                }
                self.update_interest(sink).await?;
            }
            Message::Bitfield(mut bitfield) => {
                if !was_expecting_bitfield {
                    return Err(PeerError::BitfieldNotAfterHandshake);
                }
                bitfield.resize(self.torrent.storage.piece_count, false);
                if let Some(peer_id) = self.peer_id {
                    self.piece_picker.write().await.add_peer(peer_id, &bitfield);
                }
                self.update_interest(sink).await?;
            }
            Message::Request(block) => self.serve_request(block).await?,
            Message::Cancel(block) => {
                self.incoming.remove(&block);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                if self.outgoing.remove(&block).is_none() {
                    // either unrequested or, in endgame mode, a duplicate
                    // we already got served by another peer; either way
                    // it's silently dropped (§9 open question resolved).
                    log::debug!("Peer {} sent unrequested block {:?}", self.addr, block);
                    return Ok(());
                }
                self.consecutive_timeouts = 0;
                self.download_counter.update(data.len() as u64);
                self.disk
                    .write_block(self.torrent.id, block, data, self.peer_id())?;
                self.make_requests(sink).await?;
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, sink: &mut Sink, cmd: Command) -> Result<()> {
        match cmd {
            Command::Choke(choke) => {
                if self.status.am_choking != choke {
                    self.status.am_choking = choke;
                    sink.send(if choke { Message::Choke } else { Message::Unchoke })
                        .await?;
                }
            }
            Command::Have(index) => {
                sink.send(Message::Have { piece_index: index }).await?;
            }
            Command::SendBlock(block, data) => {
                self.incoming.remove(&block);
                self.upload_counter.update(data.len() as u64);
                sink.send(Message::Block {
                    piece_index: block.piece_index,
                    offset: block.offset,
                    data,
                })
                .await?;
            }
            Command::FillPipeline => self.make_requests(sink).await?,
            Command::Shutdown => self.status.state = State::Closed,
        }
        Ok(())
    }

    async fn on_tick(&mut self, sink: &mut Sink) -> Result<()> {
        self.ticks += 1;
        self.download_counter.tick();
        self.upload_counter.tick();

        let timeout = self.conf.request_timeout;
        let now = Instant::now();
        let expired: Vec<BlockInfo> = self
            .outgoing
            .iter()
            .filter(|(_, sent_at)| now.duration_since(**sent_at) > timeout)
            .map(|(block, _)| *block)
            .collect();
        if !expired.is_empty() {
            {
                let mut db = self.piece_db.write().await;
                for block in &expired {
                    self.outgoing.remove(block);
                    if let Some(piece) = db.get_mut(block.piece_index) {
                        piece.giveback_block(*block);
                    }
                }
            }
            self.consecutive_timeouts += 1;
            log::debug!(
                "Peer {} timed out {} request(s) ({} consecutive)",
                self.addr,
                expired.len(),
                self.consecutive_timeouts
            );
            if self.consecutive_timeouts > self.conf.max_request_timeouts {
                return Err(PeerError::TooManyTimeouts);
            }
            self.make_requests(sink).await?;
        }

        if let Some(peer_id) = self.peer_id {
            let snapshot = PeerStatusSnapshot {
                download_rate: self.download_counter.rate(),
                upload_rate: self.upload_counter.rate(),
                is_peer_interested: self.status.peer_interested,
                am_choking: self.status.am_choking,
            };
            self.status_map.write().await.insert(peer_id, snapshot);
        }

        // a keepalive every two minutes of otherwise silent ticks keeps
        // the connection from being dropped by the peer's own timeout.
        if self.ticks % 120 == 0 {
            sink.send(Message::KeepAlive).await?;
        }
        Ok(())
    }

    /// Re-evaluates whether we're interested in the peer, given the
    /// availability update just applied, and notifies it of any change.
    async fn update_interest(&mut self, sink: &mut Sink) -> Result<()> {
        let peer_id = match self.peer_id {
            Some(peer_id) => peer_id,
            None => return Ok(()),
        };
        let interested = {
            let db = self.piece_db.read().await;
            let mut picker = self.piece_picker.write().await;
            picker
                .poll_piece(peer_id, &|index| {
                    db.get(index).map(|p| !p.is_saturated()).unwrap_or(false)
                })
                .is_some()
        };
        if interested != self.status.am_interested {
            self.status.am_interested = interested;
            sink.send(if interested {
                Message::Interested
            } else {
                Message::NotInterested
            })
            .await?;
        }
        if interested && !self.status.peer_choking {
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    /// Tops up the outstanding request pipeline up to `max_pipeline_len`
    /// (§4.4), pulling candidate pieces from the shared piece picker and
    /// the next requestable block from the shared piece database.
    async fn make_requests(&mut self, sink: &mut Sink) -> Result<()> {
        if self.status.peer_choking || !self.status.am_interested {
            return Ok(());
        }
        let peer_id = match self.peer_id {
            Some(peer_id) => peer_id,
            None => return Ok(()),
        };

        let mut to_send = Vec::new();
        let budget = self.conf.max_pipeline_len.saturating_sub(self.outgoing.len());
        let mut attempts = 0;
        while to_send.len() < budget && attempts < budget * 2 + 1 {
            attempts += 1;
            let (candidate, endgame) = {
                let db = self.piece_db.read().await;
                let mut picker = self.piece_picker.write().await;
                let candidate = picker.poll_piece(peer_id, &|index| {
                    db.get(index).map(|p| !p.is_saturated()).unwrap_or(false)
                });
                (candidate, picker.is_endgame())
            };
            let index = match candidate {
                Some(index) => index,
                None => break,
            };
            let block = {
                let mut db = self.piece_db.write().await;
                db.get_mut(index).and_then(|p| {
                    if endgame {
                        p.poll_block_request_endgame()
                    } else {
                        p.poll_block_request()
                    }
                })
            };
            match block {
                Some(block) => {
                    self.outgoing.insert(block, Instant::now());
                    to_send.push(block);
                }
                None => {
                    // raced with another session that just saturated this
                    // piece; the picker will surface a different one (or
                    // none) on the next iteration.
                    continue;
                }
            }
        }

        for block in to_send {
            sink.send(Message::Request(block)).await?;
        }
        Ok(())
    }

    /// Forwards a peer's block request to the torrent actor for disk
    /// service, provided we're not choking them and actually have the
    /// piece complete.
    async fn serve_request(&mut self, block: BlockInfo) -> Result<()> {
        if self.status.am_choking {
            return Ok(());
        }
        let have = {
            let db = self.piece_db.read().await;
            db.get(block.piece_index).map(|p| p.is_complete()).unwrap_or(false)
        };
        if !have {
            return Ok(());
        }
        self.incoming.insert(block);
        let _ = self.torrent_events.send(PeerEvent::ServeRequest {
            addr: self.addr,
            peer_id: self.peer_id(),
            block,
        });
        Ok(())
    }

    async fn giveback_all_outgoing(&mut self) {
        if self.outgoing.is_empty() {
            return;
        }
        let mut db = self.piece_db.write().await;
        for block in self.outgoing.keys() {
            if let Some(piece) = db.get_mut(block.piece_index) {
                piece.giveback_block(*block);
            }
        }
        self.outgoing.clear();
    }

    /// Gives back any outstanding requests and forgets this peer's
    /// availability, run once after the session's connection closes for
    /// any reason.
    async fn teardown(&mut self) {
        self.giveback_all_outgoing().await;
        if let Some(peer_id) = self.peer_id {
            self.piece_picker.write().await.remove_peer(peer_id);
        }
    }

    /// Only called once the handshake has completed, at which point the
    /// peer id is always known.
    fn peer_id(&self) -> PeerId {
        debug_assert!(self.peer_id.is_some());
        self.peer_id.unwrap_or([0; 20])
    }
}
