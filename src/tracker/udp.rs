//! UDP tracker announce (BEP 15).
//!
//! Grounded in `original_source/ccbt/tracker_udp_client.py`'s
//! connect/announce exchange; reimplemented over `tokio::net::UdpSocket`
//! with the crate's own retry primitive ([`crate::resilience::retry`])
//! standing in for the Python client's manual exponential backoff loop.

use std::{net::SocketAddr, time::Duration};

use rand::Rng;
use tokio::net::UdpSocket;

use super::{decode_compact_peers, AnnounceEvent, AnnounceRequest, AnnounceResponse};
use crate::{error::TrackerError, resilience};

/// Magic connection id used for the initial connect request (BEP 15).
const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_BACKOFF: Duration = Duration::from_secs(2);
const MAX_ATTEMPTS: usize = 4;

pub(crate) struct UdpTracker {
    url: String,
    addr: SocketAddr,
}

impl UdpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        let addr = resolve_udp_url(url)?;
        Ok(Self {
            url: url.to_string(),
            addr,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn announce(
        &self,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(TrackerError::Io)?;
        socket.connect(self.addr).await.map_err(TrackerError::Io)?;

        let connection_id = resilience::retry(MAX_ATTEMPTS, RETRY_BACKOFF, || {
            connect(&socket)
        })
        .await?;
        resilience::retry(MAX_ATTEMPTS, RETRY_BACKOFF, || {
            announce_once(&socket, connection_id, req)
        })
        .await
    }
}

fn resolve_udp_url(url: &str) -> Result<SocketAddr, TrackerError> {
    let without_scheme = url
        .strip_prefix("udp://")
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;
    // trackers sometimes append an announce path (`udp://host:port/announce`),
    // which has no meaning over UDP and is simply ignored here.
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    host_port
        .to_socket_addrs_first()
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))
}

trait ToSocketAddrFirst {
    fn to_socket_addrs_first(&self) -> Option<SocketAddr>;
}

impl ToSocketAddrFirst for str {
    fn to_socket_addrs_first(&self) -> Option<SocketAddr> {
        use std::net::ToSocketAddrs;
        self.to_socket_addrs().ok()?.next()
    }
}

async fn connect(socket: &UdpSocket) -> Result<u64, TrackerError> {
    let transaction_id: u32 = rand::thread_rng().gen();
    let mut packet = Vec::with_capacity(16);
    packet.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    packet.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());

    socket.send(&packet).await.map_err(TrackerError::Io)?;

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(REQUEST_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| TrackerError::Timeout)?
        .map_err(TrackerError::Io)?;
    if n < 16 {
        return Err(TrackerError::Http("udp connect response too short".into()));
    }
    let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let recv_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    if action != ACTION_CONNECT || recv_transaction_id != transaction_id {
        return Err(TrackerError::TransactionMismatch);
    }
    Ok(u64::from_be_bytes(buf[8..16].try_into().unwrap()))
}

async fn announce_once(
    socket: &UdpSocket,
    connection_id: u64,
    req: &AnnounceRequest,
) -> Result<AnnounceResponse, TrackerError> {
    let transaction_id: u32 = rand::thread_rng().gen();
    let key: u32 = rand::thread_rng().gen();
    let event_code: u32 = match req.event {
        AnnounceEvent::None => 0,
        AnnounceEvent::Completed => 1,
        AnnounceEvent::Started => 2,
        AnnounceEvent::Stopped => 3,
    };

    let mut packet = Vec::with_capacity(98);
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(&req.info_hash);
    packet.extend_from_slice(&req.peer_id);
    packet.extend_from_slice(&req.downloaded.to_be_bytes());
    packet.extend_from_slice(&req.left.to_be_bytes());
    packet.extend_from_slice(&req.uploaded.to_be_bytes());
    packet.extend_from_slice(&event_code.to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes()); // ip: 0 = use sender's source address
    packet.extend_from_slice(&key.to_be_bytes());
    packet.extend_from_slice(&(req.numwant as i32).to_be_bytes());
    packet.extend_from_slice(&req.port.to_be_bytes());

    socket.send(&packet).await.map_err(TrackerError::Io)?;

    let mut buf = [0u8; 2048];
    let n = tokio::time::timeout(REQUEST_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| TrackerError::Timeout)?
        .map_err(TrackerError::Io)?;
    if n < 20 {
        return Err(TrackerError::Http("udp announce response too short".into()));
    }
    let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let recv_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    if recv_transaction_id != transaction_id {
        return Err(TrackerError::TransactionMismatch);
    }
    if action != ACTION_ANNOUNCE {
        return Err(TrackerError::Failure(
            "udp tracker returned an error action".into(),
        ));
    }

    let interval = u32::from_be_bytes(buf[8..12].try_into().unwrap());
    let leechers = u32::from_be_bytes(buf[12..16].try_into().unwrap());
    let seeders = u32::from_be_bytes(buf[16..20].try_into().unwrap());
    let peers = decode_compact_peers(&buf[20..n]);

    Ok(AnnounceResponse {
        interval: Duration::from_secs(interval as u64),
        min_interval: None,
        peers,
        seeders: Some(seeders),
        leechers: Some(leechers),
        tracker_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_udp_url_ignoring_trailing_path() {
        let addr = resolve_udp_url("udp://127.0.0.1:6969/announce").unwrap();
        assert_eq!(addr.port(), 6969);
    }

    #[test]
    fn rejects_non_udp_scheme() {
        assert!(resolve_udp_url("http://127.0.0.1:6969").is_err());
    }
}
