//! Disk subsystem error types.
//!
//! Narrow, per-operation error enums (the teacher's existing style, seen
//! throughout `disk::io`), folded into a single [`Error`] only at the
//! crate boundary (see [`crate::error::Error::Disk`]).

use std::io;

/// The disk module's local result alias.
pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure allocating a new torrent's on-disk file structure.
#[derive(Debug)]
pub(crate) enum NewTorrentError {
    /// The torrent is already allocated.
    AlreadyExists,
    /// Creating the directory structure or opening a file failed.
    Io(io::Error),
}

impl std::fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "torrent already allocated"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {}

/// Failure writing a block to disk.
#[derive(Debug)]
pub(crate) enum WriteError {
    /// The block's piece index doesn't exist in this torrent.
    InvalidPieceIndex,
    /// The underlying file write failed.
    Io(io::Error),
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<io::Error> for WriteError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Failure reading a block or a whole piece back from disk.
#[derive(Debug)]
pub(crate) enum ReadError {
    /// The block or piece index doesn't exist in this torrent.
    InvalidPieceIndex,
    /// The underlying file read failed.
    Io(io::Error),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for ReadError {}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// The disk subsystem's aggregate error, used where a caller crosses the
/// boundary out of `disk` (§7 StorageFailure).
#[derive(Debug)]
pub(crate) enum Error {
    NewTorrent(NewTorrentError),
    Write(WriteError),
    Read(ReadError),
    /// The torrent id did not correspond to any allocated torrent.
    InvalidTorrentId,
    /// The blocking task performing the file IO panicked.
    BlockingTaskPanicked,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewTorrent(e) => write!(f, "{}", e),
            Self::Write(e) => write!(f, "{}", e),
            Self::Read(e) => write!(f, "{}", e),
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::BlockingTaskPanicked => write!(f, "disk blocking task panicked"),
        }
    }
}

impl std::error::Error for Error {}

impl From<NewTorrentError> for Error {
    fn from(e: NewTorrentError) -> Self {
        Self::NewTorrent(e)
    }
}

impl From<WriteError> for Error {
    fn from(e: WriteError) -> Self {
        Self::Write(e)
    }
}

impl From<ReadError> for Error {
    fn from(e: ReadError) -> Self {
        Self::Read(e)
    }
}
