//! Peer discovery via tracker announce (HTTP, BEP 3, and UDP, BEP 15).
//!
//! Grounded in `original_source/ccbt/tracker.py`'s `AsyncTrackerClient`
//! (HTTP) and `tracker_udp_client.py` (UDP): both speak the same logical
//! announce request/response shape, just framed differently on the wire,
//! so both live behind the single [`Tracker`] enum here rather than as
//! two unrelated clients callers have to choose between themselves.

pub(crate) mod http;
pub(crate) mod udp;

use std::{net::SocketAddr, time::Duration};

use tokio::time::Instant;

use crate::{error::TrackerError, PeerId, Sha1Hash};

/// Initial retry delay after a single announce failure, before any
/// doubling (`spec.md` §3 `TrackerSession.backoff_delay`).
const INITIAL_BACKOFF: Duration = Duration::from_secs(15);
/// `spec.md` §4.6/§8 property 8: the backoff sequence is capped at 5
/// minutes no matter how many consecutive failures accumulate.
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// The event announced alongside a tracker request (BEP 3 `&event=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AnnounceEvent {
    /// The first announce for a torrent.
    Started,
    /// Sent when the download completes.
    Completed,
    /// Sent when the client is shutting down gracefully.
    Stopped,
    /// A regular periodic re-announce; omitted from the request entirely.
    None,
}

impl AnnounceEvent {
    fn as_str(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::None => None,
        }
    }
}

/// Parameters for a single announce request, common to both transports.
#[derive(Debug, Clone)]
pub(crate) struct AnnounceRequest {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub numwant: u32,
}

/// A tracker's answer to an announce, with peer addresses already decoded
/// from whichever compact/dictionary form the transport used on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AnnounceResponse {
    pub interval: Duration,
    pub min_interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub tracker_id: Option<String>,
}

/// A single tracker, reached over whichever transport its announce URL's
/// scheme implies.
pub(crate) enum Tracker {
    Http(http::HttpTracker),
    Udp(udp::UdpTracker),
}

impl Tracker {
    /// Builds a tracker client for `url`, picking the transport from the
    /// URL scheme (`http(s)://` or `udp://`).
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Tracker::Http(http::HttpTracker::new(url)?))
        } else if url.starts_with("udp://") {
            Ok(Tracker::Udp(udp::UdpTracker::new(url)?))
        } else {
            Err(TrackerError::InvalidUrl(url.to_string()))
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Tracker::Http(t) => t.url(),
            Tracker::Udp(t) => t.url(),
        }
    }

    pub async fn announce(
        &mut self,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        match self {
            Tracker::Http(t) => t.announce(req).await,
            Tracker::Udp(t) => t.announce(req).await,
        }
    }
}

/// A tracker plus the failure/backoff bookkeeping `spec.md` §3 assigns to
/// `TrackerSession`: consecutive failures double `backoff_delay` up to
/// `MAX_BACKOFF`; any success resets it.
pub(crate) struct TrackerSession {
    tracker: Tracker,
    failure_count: u32,
    backoff_delay: Duration,
    retry_after: Option<Instant>,
}

impl TrackerSession {
    pub fn new(tracker: Tracker) -> Self {
        Self {
            tracker,
            failure_count: 0,
            backoff_delay: INITIAL_BACKOFF,
            retry_after: None,
        }
    }

    pub fn url(&self) -> &str {
        self.tracker.url()
    }

    /// Whether this tracker is still serving a backoff period from a
    /// prior failure and should be skipped this round.
    pub fn is_backing_off(&self) -> bool {
        self.retry_after.map(|at| Instant::now() < at).unwrap_or(false)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub async fn announce(
        &mut self,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let result = self.tracker.announce(req).await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    fn record_success(&mut self) {
        self.failure_count = 0;
        self.backoff_delay = INITIAL_BACKOFF;
        self.retry_after = None;
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
        self.retry_after = Some(Instant::now() + self.backoff_delay);
        self.backoff_delay = (self.backoff_delay * 2).min(MAX_BACKOFF);
    }
}

/// Decodes a BEP 23 compact peer list: 6 bytes per peer (4-byte IPv4
/// address, 2-byte big endian port).
pub(crate) fn decode_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::from((ip, port))
        })
        .collect()
}

/// Decodes a BEP 7 compact IPv6 peer list: 18 bytes per peer.
pub(crate) fn decode_compact_peers6(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let ip = std::net::Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::from((ip, port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_compact_ipv4_peer_list() {
        let bytes = [127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 1, 0x00, 0x50];
        let peers = decode_compact_peers(&bytes);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].port(), 0x1AE1);
        assert_eq!(peers[1].port(), 80);
    }

    #[test]
    fn picks_transport_from_url_scheme() {
        assert!(matches!(
            Tracker::new("http://tracker.test/announce").unwrap(),
            Tracker::Http(_)
        ));
        assert!(matches!(
            Tracker::new("udp://tracker.test:6969").unwrap(),
            Tracker::Udp(_)
        ));
        assert!(Tracker::new("ftp://tracker.test").is_err());
    }

    /// `spec.md` §8 property 8: k consecutive failures yield a backoff
    /// sequence that is monotonically non-decreasing and capped at 5
    /// minutes.
    #[test]
    fn consecutive_failures_double_backoff_up_to_the_five_minute_cap() {
        let mut session = TrackerSession::new(Tracker::new("http://tracker.test/announce").unwrap());
        let mut delays = Vec::new();
        for _ in 0..10 {
            delays.push(session.backoff_delay);
            session.record_failure();
        }
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert!(delays.iter().all(|d| *d <= MAX_BACKOFF));
        assert_eq!(*delays.last().unwrap(), MAX_BACKOFF);
        assert_eq!(session.failure_count(), 10);
    }

    #[test]
    fn success_resets_backoff_and_failure_count() {
        let mut session = TrackerSession::new(Tracker::new("http://tracker.test/announce").unwrap());
        session.record_failure();
        session.record_failure();
        assert!(session.failure_count() > 0);
        session.record_success();
        assert_eq!(session.failure_count(), 0);
        assert_eq!(session.backoff_delay, INITIAL_BACKOFF);
        assert!(!session.is_backing_off());
    }
}
