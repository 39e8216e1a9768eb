//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default client id.
pub const DEFAULT_CLIENT_ID: &PeerId = b"-CB0000-000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default client id, [`DEFAULT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::default(),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself: the parts that apply across
/// all torrents rather than to a single one.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,

    /// How many torrents may be actively downloading or seeding at once,
    /// combined. The rest sit in the queue until a slot frees up. `None`
    /// means unlimited.
    pub max_active_torrents: Option<usize>,

    /// How many torrents may be actively downloading at once, counted
    /// separately from `max_active_torrents`. `None` means unlimited.
    pub max_active_downloading: Option<usize>,

    /// How many torrents may be actively seeding (but not downloading) at
    /// once, counted separately from `max_active_torrents`. `None` means
    /// unlimited.
    pub max_active_seeding: Option<usize>,

    /// The total upload rate cap across all torrents, in bytes/sec. `None`
    /// means unlimited.
    pub max_upload_rate: Option<u64>,

    /// The total download rate cap across all torrents, in bytes/sec. `None`
    /// means unlimited.
    pub max_download_rate: Option<u64>,

    /// How bandwidth is split among active torrents when a global cap is in
    /// effect. See `queue::bandwidth` for the allocation strategies.
    pub bandwidth_allocation: BandwidthAllocation,

    /// How often the DHT routing table is refreshed and stale buckets are
    /// pinged.
    pub dht_refresh_interval: Duration,

    /// How long to wait for a DHT query response before considering the
    /// queried node unresponsive.
    pub dht_query_timeout: Duration,

    /// How often to request a PEX exchange from peers that support it.
    pub pex_interval: Duration,

    /// How often torrent state is checkpointed to disk so it can be resumed
    /// after a crash or restart.
    pub checkpoint_interval: Duration,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            client_id: *DEFAULT_CLIENT_ID,
            max_active_torrents: Some(5),
            max_active_downloading: Some(3),
            max_active_seeding: None,
            max_upload_rate: None,
            max_download_rate: None,
            bandwidth_allocation: BandwidthAllocation::Proportional,
            dht_refresh_interval: Duration::from_secs(15 * 60),
            dht_query_timeout: Duration::from_secs(5),
            pex_interval: Duration::from_secs(60),
            checkpoint_interval: Duration::from_secs(30),
        }
    }
}

/// Strategy used to split a global bandwidth cap among active torrents.
///
/// See `queue::bandwidth` for the implementation of each strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BandwidthAllocation {
    /// Torrents share bandwidth in proportion to their current demand
    /// (number of peers times a rolling throughput estimate).
    Proportional,
    /// Each active torrent gets an equal slice of the cap.
    Equal,
    /// Each torrent keeps whatever fixed rate it was assigned, rather than
    /// dynamically sharing the global cap.
    Fixed,
    /// Bandwidth is assigned entirely by user-specified per-torrent limits;
    /// the engine performs no automatic redistribution.
    Manual,
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
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// The upload rate cap for this torrent alone, in bytes/sec. `None`
    /// means the torrent defers entirely to the engine-wide allocation.
    pub max_upload_rate: Option<u64>,

    /// The download rate cap for this torrent alone, in bytes/sec.
    pub max_download_rate: Option<u64>,

    /// How many outstanding block requests we keep pipelined per peer.
    pub max_request_queue_len: usize,

    /// Once fewer than this many blocks remain to complete the torrent, all
    /// remaining blocks are requested from every peer that has them
    /// (endgame mode), to avoid waiting on a single slow peer at the tail of
    /// the download.
    pub endgame_block_threshold: usize,

    /// Whether to enable DHT-based peer discovery for this torrent, in
    /// addition to trackers.
    pub enable_dht: bool,

    /// Whether to enable peer exchange (PEX) for this torrent.
    pub enable_pex: bool,
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
            announce_interval: Duration::from_secs(60 * 60),
            tracker_error_threshold: 15,
            max_upload_rate: None,
            max_download_rate: None,
            max_request_queue_len: 4,
            endgame_block_threshold: 20,
            enable_dht: true,
            enable_pex: true,
        }
    }
}
