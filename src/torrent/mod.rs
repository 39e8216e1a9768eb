//! Per-torrent orchestration: owns piece state, spawns and supervises
//! peer sessions, drives tracker/DHT/PEX discovery and periodic
//! checkpointing, and carries a torrent through its lifecycle from first
//! announce to seeding.
//!
//! Built in the same actor idiom as [`crate::disk::DiskHandle`] and
//! [`crate::dht::DhtHandle`]: one owned background task, a cloneable
//! handle wrapping a command channel, callers await typed replies over
//! oneshot channels. The shared context below is consumed directly by
//! [`crate::peer::session::PeerSession`].

pub(crate) mod session;

use tokio::sync::RwLock;

use crate::{
    disk::DiskHandle, event::EventSink, piece_manager::PieceManager, storage_info::StorageInfo,
    PeerId, Sha1Hash, TorrentId,
};

pub(crate) use session::{
    spawn, Command, Torrent, TorrentHandle, TorrentParams, TorrentSource, TorrentState, TorrentStatus,
};

/// Read-mostly state shared between a torrent's own actor task and every
/// peer session it spawns: one `Arc`, cloned into each peer task, mutated
/// only behind the interior locks it carries.
pub(crate) struct SharedTorrentContext {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub piece_count: usize,
    pub piece_manager: RwLock<PieceManager>,
    pub storage: StorageInfo,
    pub disk: DiskHandle,
    pub events: EventSink,
    /// The bencoded `info` dictionary, once known. `None` for a
    /// magnet-only torrent that hasn't finished metadata acquisition yet;
    /// peer sessions read this to answer `ut_metadata` requests and to
    /// advertise `metadata_size` in their own extension handshake.
    pub metainfo_bytes: RwLock<Option<Vec<u8>>>,
}
