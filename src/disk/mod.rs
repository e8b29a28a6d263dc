//! The disk subsystem: owns all open file handles for all torrents and
//! performs (potentially blocking) file I/O off the main event loop,
//! following the teacher's actor pattern (an owned task reading commands
//! off an `mpsc::UnboundedReceiver`, replying over a per-torrent alert
//! channel) rather than the synchronous-from-callbacks model the original
//! assumes is fine for a single-threaded reactor (§5, §9).
//!
//! Unlike the teacher, which buffered a piece's blocks in memory and only
//! wrote (and hashed) them once the whole piece had arrived, this writes
//! each block through to disk as soon as it's received (§4.3 "writes
//! populate the cache and also the file dumper"): `Piece`/`PieceDb`
//! bookkeeping (§4.1, §4.2) tells the torrent actor when a piece is fully
//! downloaded, at which point it sends `Command::ValidatePiece`, which
//! reads the whole piece back and hashes it.

mod cache;
pub(crate) mod error;
mod io;

pub(crate) use cache::DiskCache;
pub(crate) use error::*;

use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task,
};

use crate::{storage_info::StorageInfo, BlockInfo, PeerId, PieceIndex, TorrentId};

/// Spawns the disk task and returns a handle to it plus the channel on
/// which it posts alerts that aren't tied to a specific torrent (currently
/// just torrent allocation results).
pub(crate) fn spawn(
) -> Result<(task::JoinHandle<Result<()>>, DiskHandle, AlertReceiver)> {
    let (mut disk, cmd_chan, alert_port) = io::Disk::new()?;
    let join_handle = task::spawn(async move { disk.start().await });
    Ok((join_handle, DiskHandle(cmd_chan), alert_port))
}

/// A cheaply cloneable handle for sending commands to the disk task.
#[derive(Clone)]
pub(crate) struct DiskHandle(CommandSender);

impl DiskHandle {
    /// Allocates a new torrent's on-disk file structure (creating
    /// directories and opening file handles as needed). The result is
    /// delivered asynchronously via [`Alert::TorrentAllocation`].
    pub fn allocate_new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        cache_capacity: u64,
    ) -> Result<()> {
        Ok(self.0.send(Command::NewTorrent {
            id,
            info,
            piece_hashes,
            cache_capacity,
        })?)
    }

    /// Queues a block write. The torrent is notified of the outcome via
    /// its [`TorrentAlert::Write`]. `peer` identifies the contributing
    /// peer so the torrent actor can attribute the block to it once the
    /// write is staged (§3 "the set of peers that contributed").
    pub fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
        peer: PeerId,
    ) -> Result<()> {
        Ok(self.0.send(Command::WriteBlock {
            id,
            info,
            data,
            peer,
        })?)
    }

    /// Queues a block read, used to serve an upload request. The result is
    /// delivered via [`TorrentAlert::Read`].
    pub fn read_block(&self, id: TorrentId, info: BlockInfo) -> Result<()> {
        Ok(self.0.send(Command::ReadBlock { id, info })?)
    }

    /// Queues hash validation of a fully downloaded piece. The result is
    /// delivered via [`TorrentAlert::Validate`].
    pub fn validate_piece(
        &self,
        id: TorrentId,
        index: PieceIndex,
    ) -> Result<()> {
        Ok(self.0.send(Command::ValidatePiece { id, index })?)
    }

    /// Tells the disk task to shut down.
    pub fn shutdown(&self) -> Result<()> {
        Ok(self.0.send(Command::Shutdown)?)
    }
}

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        // the disk task only ever stops on `Command::Shutdown`, at which
        // point no further commands should be sent; treat a disconnected
        // channel the same as the torrent id simply no longer existing.
        Self::InvalidTorrentId
    }
}

pub(crate) type CommandSender = UnboundedSender<Command>;
pub(crate) type CommandReceiver = UnboundedReceiver<Command>;

/// Commands the disk task accepts.
pub(crate) enum Command {
    /// Allocates a new torrent's file structure.
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        /// The upper bound, in bytes, of this torrent's write-through disk
        /// cache (`TorrentConf::disk_cache_capacity`).
        cache_capacity: u64,
    },
    /// Writes a downloaded block through to disk.
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
        peer: PeerId,
    },
    /// Reads a block back from disk, to serve an upload request.
    ReadBlock { id: TorrentId, info: BlockInfo },
    /// Reads a fully downloaded piece back and hashes it.
    ValidatePiece { id: TorrentId, index: PieceIndex },
    /// Shuts down the disk task.
    Shutdown,
}

pub(crate) type AlertSender = UnboundedSender<Alert>;
pub(crate) type AlertReceiver = UnboundedReceiver<Alert>;

/// Alerts not tied to an already-allocated torrent.
pub(crate) enum Alert {
    /// The result of allocating a new torrent's file structure.
    TorrentAllocation(Result<TorrentAllocation, NewTorrentError>),
}

/// Delivered once a torrent's file structure has been allocated; carries
/// the per-torrent alert channel the torrent should listen on from then
/// on.
pub(crate) struct TorrentAllocation {
    pub id: TorrentId,
    pub alert_port: TorrentAlertReceiver,
}

pub(crate) type TorrentAlertSender = UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = UnboundedReceiver<TorrentAlert>;

/// Alerts scoped to a single, already-allocated torrent.
pub(crate) enum TorrentAlert {
    /// The result of writing a block through to disk, tagged with the
    /// peer that contributed it.
    Write(Result<(BlockInfo, PeerId), WriteError>),
    /// The result of reading a block back from disk.
    Read(Result<(BlockInfo, Vec<u8>), ReadError>),
    /// The result of hashing a fully downloaded piece.
    Validate(Result<ValidationOutcome, ReadError>),
}

/// The outcome of validating a fully downloaded piece's hash.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ValidationOutcome {
    pub index: PieceIndex,
    pub is_valid: bool,
}
