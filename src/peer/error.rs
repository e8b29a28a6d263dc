//! Peer session error types (§7 ProtocolViolation / TransportFailure).
//!
//! Narrow, per-module style matching [`crate::disk::error`]: a single
//! `PeerError` enum folded into [`crate::error::Error::Peer`] at the crate
//! boundary.

use std::io;

/// The peer module's local result alias.
pub(crate) type Result<T, E = PeerError> = std::result::Result<T, E>;

/// Failure within a single peer session. Apart from `Io`, every variant is
/// a protocol violation (§7): the session is closed but the torrent as a
/// whole continues unaffected.
#[derive(Debug)]
pub(crate) enum PeerError {
    /// The peer's handshake advertised a different infohash than ours.
    InvalidInfoHash,
    /// The peer's handshake didn't start with the expected protocol string.
    InvalidProtocol,
    /// Peer sent a Bitfield message outside of the availability-exchange
    /// phase, which must immediately follow the handshake.
    BitfieldNotAfterHandshake,
    /// The underlying TCP connection failed (§7 TransportFailure).
    Io(io::Error),
    /// The connection was closed by the peer before the handshake
    /// completed.
    ConnectionClosed,
    /// The peer failed to deliver `max_request_timeouts` consecutive
    /// requests in time (§4.4).
    TooManyTimeouts,
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInfoHash => write!(f, "peer sent mismatched infohash"),
            Self::InvalidProtocol => write!(f, "peer sent invalid protocol string"),
            Self::BitfieldNotAfterHandshake => {
                write!(f, "peer sent bitfield message not after handshake")
            }
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::ConnectionClosed => write!(f, "connection closed before handshake"),
            Self::TooManyTimeouts => write!(f, "too many consecutive request timeouts"),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<io::Error> for PeerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
