//! Error types shared across the engine.
//!
//! Each component defines the error variants specific to it, and this module
//! composes them into a single top-level [`Error`] via `#[from]` conversions,
//! so that callers crossing module boundaries can use `?` freely while still
//! being able to match on the originating component when they need to.

use std::{io, net::SocketAddr};

use thiserror::Error as ThisError;

use crate::{PieceIndex, TorrentId};

/// The top-level result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The top-level error type, aggregating all component-specific errors.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("disk error: {0}")]
    Disk(#[from] DiskError),

    #[error("piece error: {0}")]
    Piece(#[from] PieceError),

    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("dht error: {0}")]
    Dht(#[from] DhtError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("unknown torrent id: {0}")]
    InvalidTorrentId(TorrentId),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("channel closed")]
    ChannelClosed,
}

/// Errors produced while decoding or encoding bencoded values.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum BencodeError {
    #[error("malformed bencode at byte {pos}: {reason}")]
    Malformed { pos: usize, reason: String },

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("dict keys not in canonical (lexicographic) order at byte {pos}")]
    KeysNotSorted { pos: usize },

    #[error("value is not the expected type")]
    WrongType,
}

/// Errors produced while parsing `.torrent` files or magnet links.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid piece hashes length: {0} is not a multiple of 20")]
    InvalidPiecesLength(usize),

    #[error("invalid magnet link: {0}")]
    InvalidMagnet(String),

    #[error("unsupported info hash length: expected 20 or 32 bytes, got {0}")]
    InvalidInfoHashLength(usize),

    #[error("multi-file torrent declares zero files")]
    NoFiles,
}

/// Errors produced by the disk I/O actor.
#[derive(ThisError, Debug)]
pub enum DiskError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("torrent {0} already exists")]
    AlreadyExists(TorrentId),

    #[error("unknown torrent id: {0}")]
    InvalidTorrentId(TorrentId),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(PieceIndex),

    #[error("write would straddle an unexpected file boundary")]
    InvalidFileBoundary,

    #[error("channel closed")]
    ChannelClosed,
}

/// Errors produced by the piece manager and its picker.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum PieceError {
    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(PieceIndex),

    #[error("piece {0} hash mismatch")]
    HashMismatch(PieceIndex),

    #[error("block offset {offset} exceeds piece length {piece_len}")]
    InvalidBlockOffset { offset: u32, piece_len: u32 },

    #[error("no pieces remain to pick")]
    NoPiecesLeft,
}

/// Errors produced by a peer session.
#[derive(ThisError, Debug)]
pub enum PeerError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("peer sent mismatching info hash")]
    InvalidPeerInfoHash,

    #[error("peer is not a seed but we need it to be one")]
    PeerNotSeed,

    #[error("bitfield message not sent directly after handshake")]
    BitfieldNotAfterHandshake,

    #[error("bitfield has invalid length: expected {expected}, got {actual}")]
    InvalidBitfieldLength { expected: usize, actual: usize },

    #[error("received message not sent in expected state")]
    UnexpectedMessage,

    #[error("peer exceeded request queue limit")]
    RequestQueueFull,

    #[error("extension handshake missing required key: {0}")]
    MissingExtension(&'static str),

    #[error("peer timed out")]
    Timeout,

    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),
}

/// Errors produced by tracker clients (HTTP and UDP).
#[derive(ThisError, Debug)]
pub enum TrackerError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("tracker returned failure reason: {0}")]
    Failure(String),

    #[error("udp tracker response transaction id mismatch")]
    TransactionMismatch,

    #[error("udp tracker connection id expired")]
    ConnectionExpired,

    #[error("malformed tracker url: {0}")]
    InvalidUrl(String),

    #[error("tracker request timed out")]
    Timeout,
}

/// Errors produced by the DHT node implementation.
#[derive(ThisError, Debug)]
pub enum DhtError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("malformed krpc message from {addr}: {reason}")]
    MalformedMessage { addr: SocketAddr, reason: String },

    #[error("query to {addr} timed out")]
    Timeout { addr: SocketAddr },

    #[error("node responded with error: {0}")]
    Remote(String),

    #[error("routing table bucket is full and node is not stale")]
    BucketFull,
}

/// Errors produced while reading or writing checkpoint state.
#[derive(ThisError, Debug)]
pub enum CheckpointError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(String),

    #[error("checkpoint version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("checkpoint is corrupt: {0}")]
    Corrupt(String),
}

/// Errors produced by the session manager and queue.
#[derive(ThisError, Debug)]
pub enum ResourceError {
    #[error("no free slot available in the active queue")]
    QueueFull,

    #[error("torrent {0} is already paused")]
    AlreadyPaused(TorrentId),

    #[error("torrent {0} is already active")]
    AlreadyActive(TorrentId),

    #[error("bandwidth limit must be greater than zero")]
    InvalidBandwidthLimit,
}
