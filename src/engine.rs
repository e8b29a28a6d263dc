//! The multi-torrent front door (§4.6, §6): the crate's public API
//! surface. Spawns the disk task once, assigns each added torrent a
//! [`TorrentId`], and owns the per-torrent actor handles.
//!
//! The teacher's own `engine.rs` played roughly this role already (owning
//! the disk task and a `HashMap<TorrentId, TorrentHandle>`), so its shape
//! is kept; what changes is what a `TorrentHandle` addresses, since
//! `torrent::Torrent` now does the piece/peer/tracker orchestration the
//! teacher's flatter design didn't have a home for.

use std::sync::Arc;

use tokio::{sync::oneshot, task};

use crate::{
    conf::Conf,
    disk::{self, Alert, DiskHandle},
    error::{Error, Result},
    metainfo::Metainfo,
    storage_info::StorageInfo,
    torrent::{self, Stats, Torrent},
    TorrentId,
};

/// A running torrent's command channel and background task handle.
struct TorrentHandle {
    cmd_tx: torrent::Sender,
    #[allow(dead_code)]
    join: task::JoinHandle<()>,
}

/// Owns the disk task and every torrent added to this process.
///
/// `add_torrent` serializes disk allocation against `alert_port`: only one
/// allocation is ever in flight at a time, so the next `Alert` read off the
/// port is always the one that belongs to the torrent currently being
/// added. This sidesteps `disk::Alert::TorrentAllocation`'s error variant
/// not carrying a [`TorrentId`] of its own.
pub struct Engine {
    conf: Conf,
    disk: DiskHandle,
    #[allow(dead_code)]
    disk_join: task::JoinHandle<disk::Result<()>>,
    alert_port: tokio::sync::Mutex<disk::AlertReceiver>,
    torrents: std::collections::HashMap<TorrentId, TorrentHandle>,
    next_id: TorrentId,
}

impl Engine {
    /// Spawns the disk task and returns a fresh engine, ready to have
    /// torrents added to it.
    pub fn new(conf: Conf) -> Result<Self> {
        let (disk_join, disk, alert_port) = disk::spawn()?;
        Ok(Self {
            conf,
            disk,
            disk_join,
            alert_port: tokio::sync::Mutex::new(alert_port),
            torrents: std::collections::HashMap::new(),
            next_id: 0,
        })
    }

    /// Parses a metainfo buffer, allocates its on-disk file structure, and
    /// spawns its torrent actor, returning the id it was assigned.
    ///
    /// Mirrors the original's manifest ingestion sequence (§6): the
    /// metainfo is fully parsed first (piece digests, file lengths and
    /// paths), then registered with the disk subsystem, and only once that
    /// allocation succeeds does the torrent start announcing and accepting
    /// peers.
    pub async fn add_torrent(&mut self, metainfo_bytes: &[u8]) -> Result<TorrentId> {
        let metainfo =
            Metainfo::from_bytes(metainfo_bytes).map_err(|_| Error::InvalidMetainfo)?;
        let id = self.next_id;
        self.next_id += 1;

        let storage = StorageInfo::new(&metainfo, self.conf.torrent.download_dir.clone());
        let piece_hashes = metainfo.info.pieces.clone();

        let alloc = {
            let mut alert_port = self.alert_port.lock().await;
            self.disk.allocate_new_torrent(
                id,
                storage,
                piece_hashes,
                self.conf.torrent.disk_cache_capacity,
            )?;
            match alert_port.recv().await {
                Some(Alert::TorrentAllocation(Ok(alloc))) => alloc,
                Some(Alert::TorrentAllocation(Err(e))) => {
                    return Err(Error::Disk(disk::Error::NewTorrent(e)))
                }
                None => return Err(Error::ChannelDisconnected),
            }
        };
        debug_assert_eq!(alloc.id, id);

        let conf = Arc::new(self.conf.torrent.clone());
        let (join, cmd_tx) = Torrent::spawn(
            id,
            &metainfo,
            conf,
            self.conf.engine.client_id,
            self.disk.clone(),
            alloc.alert_port,
        )?;
        self.torrents.insert(id, TorrentHandle { cmd_tx, join });
        Ok(id)
    }

    /// Manually connects to a peer, bypassing tracker discovery. Useful
    /// for tests and for private swarms exchanged out of band.
    pub fn connect_peer(&self, id: TorrentId, addr: std::net::SocketAddr) -> Result<()> {
        let handle = self.torrents.get(&id).ok_or(Error::InvalidTorrentId)?;
        handle
            .cmd_tx
            .send(torrent::Command::PeerDiscovered(addr))
            .map_err(|_| Error::ChannelDisconnected)
    }

    /// Requests a fresh [`Stats`] snapshot from a running torrent.
    pub async fn stats(&self, id: TorrentId) -> Result<Stats> {
        let handle = self.torrents.get(&id).ok_or(Error::InvalidTorrentId)?;
        let (tx, rx) = oneshot::channel();
        handle
            .cmd_tx
            .send(torrent::Command::GetStats(tx))
            .map_err(|_| Error::ChannelDisconnected)?;
        rx.await.map_err(|_| Error::ChannelDisconnected)
    }

    /// Tells a torrent to shut down and forgets it. Its background task
    /// tears down its peer sessions and returns on its own; this doesn't
    /// wait for that to happen.
    pub fn remove_torrent(&mut self, id: TorrentId) -> Result<()> {
        let handle = self.torrents.remove(&id).ok_or(Error::InvalidTorrentId)?;
        handle
            .cmd_tx
            .send(torrent::Command::Shutdown)
            .map_err(|_| Error::ChannelDisconnected)
    }

    /// Shuts down every running torrent and the disk task itself.
    pub fn shutdown(&mut self) -> Result<()> {
        for (_, handle) in self.torrents.drain() {
            let _ = handle.cmd_tx.send(torrent::Command::Shutdown);
        }
        self.disk.shutdown()?;
        Ok(())
    }
}
