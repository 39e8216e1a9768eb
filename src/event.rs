//! The typed event stream external consumers subscribe to.
//!
//! Generalizes the original per-torrent `Alert`/`TorrentAlert` channel
//! pair (see `disk::io`) into a single crate-wide, broadcastable event
//! enum: every long-lived task (peer session, tracker client, DHT node,
//! checkpoint writer, disk worker) emits its events onto one
//! `tokio::sync::broadcast` channel owned by `engine::Engine`, rather
//! than each caller having to wire up its own alert channel.

use std::{net::SocketAddr, time::SystemTime};

use tokio::sync::broadcast;

use crate::{PeerId, PieceIndex, Sha1Hash};

/// Default capacity of the broadcast channel. Slow subscribers that fall
/// behind this many events receive a `Lagged` error on their next `recv`
/// and skip ahead, rather than applying backpressure to the engine.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A single event emitted by the engine.
///
/// Variants and field names intentionally mirror the external interface
/// so that a consumer reading the wire documentation can map 1:1 to this
/// enum.
#[derive(Debug, Clone)]
pub enum Event {
    TorrentAdded {
        info_hash: Sha1Hash,
        name: String,
    },
    TorrentRemoved {
        info_hash: Sha1Hash,
    },
    MetadataComplete {
        info_hash: Sha1Hash,
        /// The assembled, hash-verified bencoded `info` dictionary.
        info: Vec<u8>,
    },
    PieceVerified {
        info_hash: Sha1Hash,
        index: PieceIndex,
    },
    PieceFailed {
        info_hash: Sha1Hash,
        index: PieceIndex,
        offending_peers: Vec<PeerId>,
    },
    DownloadComplete {
        info_hash: Sha1Hash,
    },
    PeerConnected {
        info_hash: Sha1Hash,
        peer: SocketAddr,
    },
    PeerDisconnected {
        info_hash: Sha1Hash,
        peer: SocketAddr,
        reason: String,
    },
    TrackerAnnouncement {
        info_hash: Sha1Hash,
        url: String,
        ok: bool,
        interval: Option<u64>,
        error: Option<String>,
    },
    DhtPeersFound {
        info_hash: Sha1Hash,
        count: usize,
    },
    PexPeersReceived {
        info_hash: Sha1Hash,
        peers: Vec<SocketAddr>,
    },
    CheckpointSaved {
        info_hash: Sha1Hash,
        ts: SystemTime,
    },
    CheckpointFailed {
        info_hash: Sha1Hash,
        reason: String,
    },
}

/// The sending half, held by `engine::Engine` and cloned to every task that
/// needs to publish events.
#[derive(Clone)]
pub struct EventSink(broadcast::Sender<Event>);

/// A registered consumer's receiving half.
pub type EventStream = broadcast::Receiver<Event>;

impl EventSink {
    pub fn new() -> (Self, EventStream) {
        let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        (Self(tx), rx)
    }

    /// Registers a new, independent consumer of the event stream.
    pub fn subscribe(&self) -> EventStream {
        self.0.subscribe()
    }

    /// Publishes an event to every current subscriber.
    ///
    /// Returns without error even if there are no subscribers: the engine
    /// doesn't require a consumer to be present.
    pub fn emit(&self, event: Event) {
        // a send error here just means there are currently no subscribers,
        // which is a normal and expected state, not a failure
        let _ = self.0.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let (sink, mut stream) = EventSink::new();
        sink.emit(Event::TorrentRemoved {
            info_hash: [0u8; 20],
        });
        let event = stream.recv().await.unwrap();
        assert!(matches!(event, Event::TorrentRemoved { .. }));
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let (sink, _stream) = EventSink::new();
        sink.emit(Event::DownloadComplete {
            info_hash: [1u8; 20],
        });
    }
}
