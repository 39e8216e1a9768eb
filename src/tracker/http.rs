//! HTTP(S) tracker announce (BEP 3).
//!
//! Grounded in `original_source/ccbt/tracker.py`'s `_build_tracker_url` and
//! `_parse_response_async`, using `reqwest` (already a dependency of this
//! crate) for the request and the crate's own [`crate::bencode`] decoder for
//! the response instead of `aiohttp` + a bespoke bencode decoder.

use std::time::Duration;

use percent_encoding::{percent_encode, AsciiSet, CONTROLS};

use super::{decode_compact_peers, decode_compact_peers6, AnnounceRequest, AnnounceResponse};
use crate::{bencode, error::TrackerError};

/// The request timeout for a single announce.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Bytes that must be percent-encoded in a tracker query string beyond
/// what `CONTROLS` already covers; trackers expect raw 20-byte info
/// hashes and peer ids to come through as `%XX`-escaped octets.
const QUERY_ASCII_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'/')
    .add(b':')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'=')
    .add(b'@')
    .add(b'[')
    .add(b']');

pub(crate) struct HttpTracker {
    url: String,
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TrackerError::Http(e.to_string()))?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn announce(
        &self,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let url = build_announce_url(&self.url, req);
        let bytes = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TrackerError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| TrackerError::Http(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| TrackerError::Http(e.to_string()))?;
        parse_announce_response(&bytes)
    }
}

fn build_announce_url(base: &str, req: &AnnounceRequest) -> String {
    let mut url = String::with_capacity(base.len() + 128);
    url.push_str(base);
    url.push(if base.contains('?') { '&' } else { '?' });
    url.push_str("info_hash=");
    url.push_str(&percent_encode(&req.info_hash, QUERY_ASCII_SET).to_string());
    url.push_str("&peer_id=");
    url.push_str(&percent_encode(&req.peer_id, QUERY_ASCII_SET).to_string());
    url.push_str(&format!(
        "&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
        req.port, req.uploaded, req.downloaded, req.left, req.numwant
    ));
    if let Some(event) = req.event.as_str() {
        url.push_str("&event=");
        url.push_str(event);
    }
    url
}

fn parse_announce_response(bytes: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = bencode::decode(bytes)?;
    let dict = value.as_dict().ok_or_else(|| {
        TrackerError::Failure("tracker response is not a bencoded dict".into())
    })?;

    if let Some(reason) = dict.get(&b"failure reason"[..]).and_then(|v| v.as_bytes()) {
        return Err(TrackerError::Failure(
            String::from_utf8_lossy(reason).into_owned(),
        ));
    }

    let interval = dict
        .get(&b"interval"[..])
        .and_then(|v| v.as_int())
        .unwrap_or(1800)
        .max(0) as u64;
    let min_interval = dict
        .get(&b"min interval"[..])
        .and_then(|v| v.as_int())
        .map(|n| Duration::from_secs(n.max(0) as u64));
    let seeders = dict
        .get(&b"complete"[..])
        .and_then(|v| v.as_int())
        .map(|n| n.max(0) as u32);
    let leechers = dict
        .get(&b"incomplete"[..])
        .and_then(|v| v.as_int())
        .map(|n| n.max(0) as u32);
    let tracker_id = dict
        .get(&b"tracker id"[..])
        .and_then(|v| v.as_bytes())
        .map(|b| String::from_utf8_lossy(b).into_owned());

    let mut peers = Vec::new();
    match dict.get(&b"peers"[..]) {
        Some(value) => {
            if let Some(bytes) = value.as_bytes() {
                peers.extend(decode_compact_peers(bytes));
            } else if let Some(list) = value.as_list() {
                for entry in list {
                    if let Some(dict) = entry.as_dict() {
                        if let (Some(ip), Some(port)) = (
                            dict.get(&b"ip"[..]).and_then(|v| v.as_bytes()),
                            dict.get(&b"port"[..]).and_then(|v| v.as_int()),
                        ) {
                            if let Ok(ip) = String::from_utf8_lossy(ip).parse() {
                                peers.push(std::net::SocketAddr::new(ip, port as u16));
                            }
                        }
                    }
                }
            }
        }
        None => {}
    }
    if let Some(bytes) = dict.get(&b"peers6"[..]).and_then(|v| v.as_bytes()) {
        peers.extend(decode_compact_peers6(bytes));
    }

    Ok(AnnounceResponse {
        interval: Duration::from_secs(interval),
        min_interval,
        peers,
        seeders,
        leechers,
        tracker_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::AnnounceEvent;

    fn sample_request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [1u8; 20],
            peer_id: [2u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: AnnounceEvent::Started,
            numwant: 50,
        }
    }

    #[test]
    fn builds_announce_url_with_percent_encoded_binary_fields() {
        let url = build_announce_url("http://tracker.test/announce", &sample_request());
        assert!(url.starts_with("http://tracker.test/announce?info_hash=%01%01%01"));
        assert!(url.contains("&event=started"));
        assert!(url.contains("&compact=1"));
    }

    #[test]
    fn appends_query_params_with_ampersand_when_base_already_has_query() {
        let url = build_announce_url("http://tracker.test/a?x=1", &sample_request());
        assert!(url.starts_with("http://tracker.test/a?x=1&info_hash="));
    }

    #[test]
    fn parses_compact_peer_response() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers6:");
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        body.extend_from_slice(b"e");
        let response = parse_announce_response(&body).unwrap();
        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.peers.len(), 1);
    }

    #[test]
    fn surfaces_failure_reason() {
        let body = b"d14:failure reason13:not registerede";
        let err = parse_announce_response(body).unwrap_err();
        assert!(matches!(err, TrackerError::Failure(reason) if reason == "not registered"));
    }
}
