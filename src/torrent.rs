//! The download manager for a single torrent (§4.6 DownloadManager): owns
//! the piece database, the piece selector, the disk handle, and the map of
//! connected peer sessions, and drives the periodic choke rotation and
//! tracker re-announce.
//!
//! Not part of the retrieved teacher files — the teacher had no
//! multi-peer orchestration layer at all, since `peer::PeerSession` talked
//! to a single pre-supplied seed directly from the CLI front-end. This
//! follows the same actor shape `disk/mod.rs` establishes (an owned task
//! reading commands off an `mpsc::UnboundedReceiver`) rather than the
//! original's single global mutex with synchronous callbacks (§9, the
//! open question this resolves).

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{select, stream::Fuse, StreamExt};
use rand::seq::SliceRandom;
use tokio::{
    sync::{mpsc, RwLock},
    task, time,
};

use crate::{
    conf::TorrentConf,
    disk::{DiskHandle, TorrentAlert, TorrentAlertReceiver},
    error::{Error, Result},
    metainfo::Metainfo,
    peer::{self, PeerSession},
    piece_db::PieceDb,
    piece_picker::{PiecePicker, PieceSelector},
    storage_info::{FsStructure, StorageInfo},
    tracker::{AnnounceParams, Event as TrackerEvent, Tracker},
    BlockInfo, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// The torrent-wide facts a peer session needs but never mutates (§4.6):
/// its id, infohash, our own client id, and its storage layout.
pub(crate) struct SharedStatus {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub storage: StorageInfo,
}

/// A peer session's latest self-reported throughput and interest, used by
/// the choke rotation (§4.6, §9 "rate-based regular unchoke").
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PeerStatusSnapshot {
    pub download_rate: f64,
    pub upload_rate: f64,
    pub is_peer_interested: bool,
    pub am_choking: bool,
}

pub(crate) type PeerStatusMap = Arc<RwLock<HashMap<PeerId, PeerStatusSnapshot>>>;

/// Events a peer session reports back to the torrent actor that owns it.
pub(crate) enum PeerEvent {
    /// The handshake completed and the peer's id is now known.
    Connected { addr: SocketAddr, peer_id: PeerId },
    /// The session ended, for any reason.
    Disconnected { addr: SocketAddr },
    /// The peer requested `block` and we're willing to serve it; the
    /// torrent actor owns the disk handle needed to read it back.
    ServeRequest {
        addr: SocketAddr,
        peer_id: PeerId,
        block: BlockInfo,
    },
}

/// Commands the engine (or, eventually, a CLI front-end) sends to a
/// running torrent actor.
pub(crate) enum Command {
    /// A peer address learned from a tracker announce or added manually.
    PeerDiscovered(SocketAddr),
    /// Requests a snapshot of the torrent's current [`Stats`] (§6 "Stats
    /// structure returned by periodic").
    GetStats(tokio::sync::oneshot::Sender<Stats>),
    Shutdown,
}

pub(crate) type Sender = mpsc::UnboundedSender<Command>;
pub(crate) type Receiver = mpsc::UnboundedReceiver<Command>;

/// Aggregate progress/throughput figures, mirroring the original's
/// `periodic` status structure (§6): peers (total known), connected,
/// choking (of the connected peers, how many we're choking), and
/// failed_connection (sessions that never reached `Established`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub peers: usize,
    pub connected: usize,
    pub choking: usize,
    pub failed_connection: u64,
    pub downloaded_pieces: usize,
    pub completed_pieces: usize,
    pub total_pieces: usize,
    pub download_rate: f64,
    pub upload_rate: f64,
}

struct PeerHandle {
    sender: peer::Sender,
    peer_id: Option<PeerId>,
}

/// Owns everything scoped to a single torrent and drives it to completion
/// (or indefinite seeding, unless `shutdown_when_complete` is set).
pub(crate) struct Torrent {
    status: Arc<SharedStatus>,
    conf: Arc<TorrentConf>,
    piece_db: Arc<RwLock<PieceDb>>,
    piece_picker: Arc<RwLock<PiecePicker>>,
    disk: DiskHandle,
    disk_alerts: Fuse<TorrentAlertReceiver>,
    status_map: PeerStatusMap,
    peers: HashMap<SocketAddr, PeerHandle>,
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    tracker: Tracker,
    announce_interval: Duration,
    last_announce: Instant,
    /// Peers waiting on a block read that's already in flight, keyed by
    /// the block so concurrent requests for the same bytes share one disk
    /// read.
    pending_serve: HashMap<BlockInfo, Vec<SocketAddr>>,
    /// Counts repeated hash-validation failures attributable to a peer
    /// (§7 "contributors are marked suspicious; repeated mismatches from
    /// the same peer eventually close the connection").
    suspect_counts: HashMap<PeerId, u32>,
    /// Sessions that disconnected without ever reaching `Established`
    /// (§6 Stats "failed_connection").
    failed_connections: u64,
    tick_count: u64,
}

impl Torrent {
    /// Builds and spawns a torrent actor, returning a handle to address it
    /// and its background task's join handle.
    pub fn spawn(
        id: TorrentId,
        metainfo: &Metainfo,
        conf: Arc<TorrentConf>,
        client_id: PeerId,
        disk: DiskHandle,
        disk_alerts: TorrentAlertReceiver,
    ) -> Result<(task::JoinHandle<()>, Sender)> {
        let info_hash = metainfo
            .create_info_hash()
            .map_err(|_| Error::InvalidMetainfo)?;
        let storage = StorageInfo::new(metainfo, conf.download_dir.clone());

        let mut piece_db = PieceDb::new();
        piece_db.set_piece_length(storage.piece_len);
        match &storage.structure {
            FsStructure::File(file) => piece_db.increase_piece_space(file.len),
            FsStructure::Archive { files } => {
                for file in files {
                    piece_db.increase_piece_space(file.len);
                }
            }
        }
        for digest in metainfo.info.pieces.chunks_exact(20) {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(digest);
            piece_db.add(hash);
        }
        piece_db.finalize();

        let piece_picker = PiecePicker::new(storage.piece_count);
        let tracker = Tracker::new(metainfo.announce_urls());

        let (cmd_tx, cmd_port) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events_port) = mpsc::unbounded_channel();

        let torrent = Self {
            status: Arc::new(SharedStatus {
                id,
                info_hash,
                client_id,
                storage,
            }),
            announce_interval: conf.announce_interval,
            conf,
            piece_db: Arc::new(RwLock::new(piece_db)),
            piece_picker: Arc::new(RwLock::new(piece_picker)),
            disk,
            disk_alerts: disk_alerts.fuse(),
            status_map: Arc::new(RwLock::new(HashMap::new())),
            peers: HashMap::new(),
            peer_events_tx,
            tracker,
            last_announce: Instant::now(),
            pending_serve: HashMap::new(),
            suspect_counts: HashMap::new(),
            failed_connections: 0,
            tick_count: 0,
        };

        let join = task::spawn(torrent.run(cmd_port.fuse(), peer_events_port.fuse()));
        Ok((join, cmd_tx))
    }

    async fn run(
        mut self,
        mut cmd_port: Fuse<Receiver>,
        mut peer_events: Fuse<mpsc::UnboundedReceiver<PeerEvent>>,
    ) {
        self.start_announce().await;
        let mut ticker = time::interval(Duration::from_secs(1)).fuse();

        loop {
            select! {
                cmd = cmd_port.select_next_some() => {
                    match cmd {
                        Command::PeerDiscovered(addr) => self.connect_peer(addr),
                        Command::GetStats(reply) => {
                            let stats = self.collect_stats().await;
                            let _ = reply.send(stats);
                        }
                        Command::Shutdown => break,
                    }
                }
                event = peer_events.select_next_some() => {
                    self.handle_peer_event(event).await;
                }
                alert = self.disk_alerts.select_next_some() => {
                    self.handle_disk_alert(alert).await;
                }
                _ = ticker.select_next_some() => {
                    if self.on_tick().await {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    fn connect_peer(&mut self, addr: SocketAddr) {
        if self.peers.contains_key(&addr)
            || self.peers.len() >= self.conf.max_connected_peer_count
        {
            return;
        }
        let (mut session, sender) = PeerSession::outbound(
            Arc::clone(&self.status),
            Arc::clone(&self.conf),
            Arc::clone(&self.piece_db),
            Arc::clone(&self.piece_picker),
            self.disk.clone(),
            Arc::clone(&self.status_map),
            self.peer_events_tx.clone(),
            addr,
        );
        self.peers.insert(
            addr,
            PeerHandle {
                sender,
                peer_id: None,
            },
        );
        task::spawn(async move {
            if let Err(e) = session.start().await {
                log::warn!("Peer session {} ended: {}", addr, e);
            }
        });
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { addr, peer_id } => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.peer_id = Some(peer_id);
                }
            }
            PeerEvent::Disconnected { addr } => {
                if let Some(handle) = self.peers.remove(&addr) {
                    match handle.peer_id {
                        Some(peer_id) => {
                            self.status_map.write().await.remove(&peer_id);
                        }
                        None => self.failed_connections += 1,
                    }
                }
            }
            PeerEvent::ServeRequest {
                addr,
                peer_id: _,
                block,
            } => {
                let waiters = self.pending_serve.entry(block).or_insert_with(Vec::new);
                let is_first = waiters.is_empty();
                waiters.push(addr);
                if is_first {
                    if let Err(e) = self.disk.read_block(self.status.id, block) {
                        log::warn!("Failed to queue upload read: {}", e);
                        self.pending_serve.remove(&block);
                    }
                }
            }
        }
    }

    async fn handle_disk_alert(&mut self, alert: TorrentAlert) {
        match alert {
            TorrentAlert::Write(Ok((block, peer))) => {
                let outcome = self
                    .piece_db
                    .write()
                    .await
                    .mark_block_downloaded(block.piece_index, block, peer);
                if let Some(outcome) = outcome {
                    if outcome.newly_complete {
                        if let Err(e) = self.disk.validate_piece(self.status.id, block.piece_index)
                        {
                            log::error!("Failed to queue piece validation: {}", e);
                        }
                    }
                }
            }
            TorrentAlert::Write(Err(e)) => {
                log::warn!("Block write failed: {}", e);
            }
            TorrentAlert::Read(Ok((block, data))) => {
                if let Some(waiters) = self.pending_serve.remove(&block) {
                    for addr in waiters {
                        if let Some(handle) = self.peers.get(&addr) {
                            let _ = handle
                                .sender
                                .send(peer::Command::SendBlock(block, data.clone()));
                        }
                    }
                }
            }
            TorrentAlert::Read(Err(e)) => {
                log::warn!("Block read failed: {}", e);
            }
            TorrentAlert::Validate(Ok(outcome)) => {
                self.piece_db
                    .write()
                    .await
                    .complete_validation(outcome.index, outcome.is_valid);
                if outcome.is_valid {
                    self.piece_picker.write().await.have_piece(outcome.index);
                    log::info!("Piece {} complete and verified", outcome.index);
                    for handle in self.peers.values() {
                        let _ = handle.sender.send(peer::Command::Have(outcome.index));
                    }
                } else {
                    let mismatch = crate::error::HashMismatch {
                        piece_index: outcome.index,
                        torrent_id: self.status.id,
                    };
                    log::warn!("{:?}: piece failed hash validation", mismatch);
                    self.mark_contributors_suspicious(mismatch).await;
                    // the piece's download progress was just dropped, so it's
                    // requestable again; nudge peers to top up their pipeline.
                    for handle in self.peers.values() {
                        let _ = handle.sender.send(peer::Command::FillPipeline);
                    }
                }
            }
            TorrentAlert::Validate(Err(e)) => {
                log::error!("Piece validation read failed: {}", e);
            }
        }
    }

    /// Flags every peer that contributed to a piece that just failed hash
    /// validation, disconnecting any peer that's done this repeatedly
    /// (§7 HashMismatch).
    async fn mark_contributors_suspicious(&mut self, mismatch: crate::error::HashMismatch) {
        let contributors: Vec<PeerId> = {
            let db = self.piece_db.read().await;
            db.get(mismatch.piece_index)
                .map(|piece| piece.contributors().iter().copied().collect())
                .unwrap_or_default()
        };
        for peer_id in contributors {
            let count = self.suspect_counts.entry(peer_id).or_insert(0);
            *count += 1;
            if *count >= 3 {
                log::warn!(
                    "Disconnecting peer {:?}: {} consecutive bad pieces ({:?})",
                    peer_id,
                    count,
                    mismatch,
                );
                if let Some(handle) = self.peers.values().find(|h| h.peer_id == Some(peer_id)) {
                    let _ = handle.sender.send(peer::Command::Shutdown);
                }
            }
        }
    }

    /// Returns `true` if the torrent should shut down.
    async fn on_tick(&mut self) -> bool {
        self.tick_count += 1;

        self.maybe_reannounce().await;

        if self.tick_count % self.conf.regular_unchoke_interval.as_secs().max(1) == 0 {
            self.regular_unchoke_rotation().await;
        }
        if self.tick_count % self.conf.optimistic_unchoke_interval.as_secs().max(1) == 0 {
            self.optimistic_unchoke().await;
        }

        let (num_pieces, num_completed, num_downloaded) = {
            let db = self.piece_db.read().await;
            (db.length(), db.num_completed(), db.num_downloaded())
        };
        let incomplete = num_pieces.saturating_sub(num_completed);
        self.piece_picker
            .write()
            .await
            .set_endgame(incomplete <= self.conf.endgame_piece_threshold);

        if self.tick_count % 10 == 0 {
            let stats = self
                .collect_stats_with(num_downloaded, num_completed, num_pieces)
                .await;
            log::info!(
                "Torrent {}: {}/{} pieces, {}/{} peers connected, {} choking, down {:.1} KiB/s, up {:.1} KiB/s",
                self.status.id,
                stats.completed_pieces,
                stats.total_pieces,
                stats.connected,
                stats.peers,
                stats.choking,
                stats.download_rate / 1024.0,
                stats.upload_rate / 1024.0,
            );
        }

        if self.conf.shutdown_when_complete && num_completed == num_pieces {
            log::info!("Torrent {} complete, shutting down", self.status.id);
            let params = self.announce_params(Some(TrackerEvent::Completed)).await;
            let _ = self.tracker.announce(&params).await;
            return true;
        }
        false
    }

    /// Builds a [`Stats`] snapshot given already-collected piece counts,
    /// to avoid re-locking `piece_db` when called from [`Self::on_tick`],
    /// which has just read them.
    async fn collect_stats_with(
        &self,
        downloaded: usize,
        completed: usize,
        total: usize,
    ) -> Stats {
        let snapshot = self.status_map.read().await;
        let (download_rate, upload_rate, choking) = snapshot.values().fold(
            (0.0, 0.0, 0usize),
            |(d, u, c), s| (d + s.download_rate, u + s.upload_rate, c + s.am_choking as usize),
        );
        Stats {
            peers: self.peers.len(),
            connected: snapshot.len(),
            choking,
            failed_connection: self.failed_connections,
            downloaded_pieces: downloaded,
            completed_pieces: completed,
            total_pieces: total,
            download_rate,
            upload_rate,
        }
    }

    /// Builds a [`Stats`] snapshot from scratch, for [`Command::GetStats`].
    async fn collect_stats(&self) -> Stats {
        let (total, completed, downloaded) = {
            let db = self.piece_db.read().await;
            (db.length(), db.num_completed(), db.num_downloaded())
        };
        self.collect_stats_with(downloaded, completed, total).await
    }

    async fn announce_params(&self, event: Option<TrackerEvent>) -> AnnounceParams {
        let completed = self.piece_db.read().await.num_completed() as u64;
        let downloaded = completed * self.status.storage.piece_len as u64;
        let left = self.status.storage.download_len.saturating_sub(downloaded);
        AnnounceParams {
            info_hash: self.status.info_hash,
            peer_id: self.status.client_id,
            port: 0,
            uploaded: 0,
            downloaded,
            left,
            event,
        }
    }

    async fn start_announce(&mut self) {
        let params = self.announce_params(Some(TrackerEvent::Started)).await;
        match self.tracker.announce(&params).await {
            Ok(response) => {
                log::info!(
                    "Torrent {}: announce succeeded, {} peers",
                    self.status.id,
                    response.peers.len()
                );
                self.announce_interval = response.interval;
                for addr in response.peers {
                    self.connect_peer(addr);
                }
            }
            Err(e) => log::warn!("Torrent {}: initial announce failed: {}", self.status.id, e),
        }
        self.last_announce = Instant::now();
    }

    /// Re-announces once the tracker's requested interval has elapsed, or
    /// sooner if we've fallen below the minimum peer count (§7
    /// TransportFailure handling, §6).
    async fn maybe_reannounce(&mut self) {
        let due = Instant::now().duration_since(self.last_announce) >= self.announce_interval;
        let starved = self.peers.len() < self.conf.min_requested_peer_count;
        if !due && !starved {
            return;
        }
        let params = self.announce_params(None).await;
        match self.tracker.announce(&params).await {
            Ok(response) => {
                self.announce_interval = response.interval;
                for addr in response.peers {
                    self.connect_peer(addr);
                }
            }
            Err(e) => log::warn!("Torrent {}: re-announce failed: {}", self.status.id, e),
        }
        self.last_announce = Instant::now();
    }

    /// Unchokes the `max_unchoked_count` interested peers with the best
    /// download rate, choking everyone else (§4.4, §9).
    async fn regular_unchoke_rotation(&mut self) {
        let snapshot = self.status_map.read().await.clone();
        let mut candidates: Vec<(PeerId, f64)> = snapshot
            .iter()
            .filter(|(_, status)| status.is_peer_interested)
            .map(|(peer_id, status)| (*peer_id, status.download_rate))
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(self.conf.max_unchoked_count);
        let unchoked: std::collections::HashSet<PeerId> =
            candidates.into_iter().map(|(peer_id, _)| peer_id).collect();

        for handle in self.peers.values() {
            if let Some(peer_id) = handle.peer_id {
                let choke = !unchoked.contains(&peer_id);
                let _ = handle.sender.send(peer::Command::Choke(choke));
            }
        }
    }

    /// Unchokes one additional, arbitrarily chosen peer regardless of its
    /// rate, giving newly connected or slow-to-prove peers a chance (§4.4).
    async fn optimistic_unchoke(&mut self) {
        let candidates: Vec<PeerId> = self.peers.values().filter_map(|h| h.peer_id).collect();
        let mut rng = rand::thread_rng();
        if let Some(&peer_id) = candidates.choose(&mut rng) {
            if let Some(handle) = self.peers.values().find(|h| h.peer_id == Some(peer_id)) {
                let _ = handle.sender.send(peer::Command::Choke(false));
            }
        }
    }

    async fn shutdown(&mut self) {
        log::info!("Torrent {} shutting down", self.status.id);
        for handle in self.peers.values() {
            let _ = handle.sender.send(peer::Command::Shutdown);
        }
    }
}
