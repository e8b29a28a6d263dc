//! Crate-wide error types.
//!
//! Each subsystem that performs fallible I/O defines its own narrow error
//! enum (see [`crate::disk::error`], [`crate::peer`], [`crate::tracker`]);
//! this module defines the top-level [`Error`] that those are folded into
//! wherever a caller crosses a subsystem boundary, plus the [`Result`] alias
//! used throughout the crate.

use std::io;

use crate::{disk, peer, tracker, PieceIndex, TorrentId};

/// The crate-wide result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The top-level error type, covering everything that can go wrong across
/// the engine.
#[derive(Debug)]
pub enum Error {
    /// Wraps a plain IO error (file or socket).
    Io(io::Error),
    /// A piece index was out of bounds for the torrent.
    InvalidPieceIndex,
    /// A torrent id did not correspond to any known torrent.
    InvalidTorrentId,
    /// A bencoded manifest could not be parsed.
    InvalidMetainfo,
    /// A disk subsystem error (§7 StorageFailure).
    Disk(disk::error::Error),
    /// A peer session protocol violation (§7 ProtocolViolation) or
    /// transport failure (§7 TransportFailure).
    Peer(peer::PeerError),
    /// All announce URLs were exhausted (§7 TrackerFailure).
    Tracker(tracker::TrackerError),
    /// An `mpsc` channel was disconnected, meaning the task on the other
    /// end has already stopped.
    ChannelDisconnected,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::InvalidMetainfo => write!(f, "invalid metainfo"),
            Self::Disk(e) => write!(f, "disk error: {}", e),
            Self::Peer(e) => write!(f, "peer error: {}", e),
            Self::Tracker(e) => write!(f, "tracker error: {}", e),
            Self::ChannelDisconnected => write!(f, "channel disconnected"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<disk::error::Error> for Error {
    fn from(e: disk::error::Error) -> Self {
        Self::Disk(e)
    }
}

impl From<peer::PeerError> for Error {
    fn from(e: peer::PeerError) -> Self {
        Self::Peer(e)
    }
}

impl From<tracker::TrackerError> for Error {
    fn from(e: tracker::TrackerError) -> Self {
        Self::Tracker(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelDisconnected
    }
}

/// A piece failed hash validation (§7 HashMismatch). This doesn't escape to
/// the I/O layer; it's constructed inside [`crate::torrent`]'s disk alert
/// handler and passed along to its contributor-flagging logic, so both of
/// that module's hash-mismatch log sites format the same uniform `{:?}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashMismatch {
    pub piece_index: PieceIndex,
    pub torrent_id: TorrentId,
}
