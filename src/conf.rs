//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::{
    PeerId, ENDGAME_PIECE_THRESHOLD, MAX_PIPELINE_LEN, MAX_REQUEST_TIMEOUTS,
    MAX_UNCHOKED_COUNT, OPTIMISTIC_UNCHOKE_INTERVAL,
    REGULAR_UNCHOKE_INTERVAL, REQUEST_TIMEOUT,
};

/// The default cratetorrent client id.
pub const CRATETORRENT_CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default cratetorrent client id,
    /// [`CRATETORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CRATETORRENT_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every hour.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// The number of block requests kept outstanding per peer once
    /// unchoked (§4.4 "up to max_pipeline requests").
    pub max_pipeline_len: usize,

    /// How long we wait for a block to arrive for a request before it is
    /// given back to the piece as a timeout.
    pub request_timeout: Duration,

    /// Consecutive request timeouts after which a peer is disconnected.
    pub max_request_timeouts: usize,

    /// The number of remaining incomplete pieces at or below which the
    /// piece selector switches to endgame mode and allows duplicate
    /// requests.
    pub endgame_piece_threshold: usize,

    /// The maximum number of peers kept unchoked at once.
    pub max_unchoked_count: usize,

    /// Cadence of the regular (rate-based) unchoke rotation.
    pub regular_unchoke_interval: Duration,

    /// Cadence of the optimistic unchoke rotation.
    pub optimistic_unchoke_interval: Duration,

    /// The upper bound, in bytes, on the disk cache's write-through block
    /// buffer (§4.3). Once reached, the least recently used blocks of
    /// incomplete pieces are evicted.
    pub disk_cache_capacity: u64,

    /// If set, the torrent shuts down as soon as all pieces are complete
    /// instead of continuing to seed. Carried over from the original
    /// implementation's `shutdown_when_complete` config key.
    pub shutdown_when_complete: bool,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            // needs teting
            announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,
            max_pipeline_len: MAX_PIPELINE_LEN,
            request_timeout: REQUEST_TIMEOUT,
            max_request_timeouts: MAX_REQUEST_TIMEOUTS,
            endgame_piece_threshold: ENDGAME_PIECE_THRESHOLD,
            max_unchoked_count: MAX_UNCHOKED_COUNT,
            regular_unchoke_interval: REGULAR_UNCHOKE_INTERVAL,
            optimistic_unchoke_interval: OPTIMISTIC_UNCHOKE_INTERVAL,
            // 10 MiB is enough to absorb a handful of in-flight pieces
            // without unbounded growth; see DiskCache's LRU eviction.
            disk_cache_capacity: 10 * 1024 * 1024,
            shutdown_when_complete: false,
        }
    }
}
