//! Magnet URI parsing (BEP 9).
//!
//! A magnet link carries enough information to join a swarm and fetch the
//! rest of the torrent's metadata from peers (via the `ut_metadata`
//! extension, see `peer::extension`) or from the DHT, without ever
//! downloading a `.torrent` file.

use url::Url;

use crate::{error::MetainfoError, Sha1Hash};

/// The decoded `xt=urn:btih:` / `xt=urn:btmh:` parameter.
///
/// Hybrid (v1+v2) torrents advertise a 32-byte v2 root hash; pure v1
/// torrents advertise the familiar 20-byte SHA-1 info hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoHash {
    V1(Sha1Hash),
    V2([u8; 32]),
}

impl InfoHash {
    /// The 20-byte v1 hash, when this is a v1 link.
    pub fn as_v1(&self) -> Option<&Sha1Hash> {
        match self {
            InfoHash::V1(h) => Some(h),
            InfoHash::V2(_) => None,
        }
    }
}

/// Everything extracted from a parsed magnet URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    pub web_seeds: Vec<String>,
}

/// Parses a magnet URI, e.g.
/// `magnet:?xt=urn:btih:<hash>&dn=<name>&tr=<tracker>&tr=<tracker2>`.
///
/// Supports `xt` (required, `urn:btih:` or `urn:btmh:`), `dn`, repeated
/// `tr`, and repeated `ws` (BEP 19 web seeds).
pub fn parse(uri: &str) -> Result<MagnetLink, MetainfoError> {
    let url = Url::parse(uri).map_err(|e| MetainfoError::InvalidMagnet(e.to_string()))?;
    if url.scheme() != "magnet" {
        return Err(MetainfoError::InvalidMagnet(format!(
            "unexpected scheme {:?}, expected `magnet`",
            url.scheme()
        )));
    }

    let mut info_hash = None;
    let mut display_name = None;
    let mut trackers = Vec::new();
    let mut web_seeds = Vec::new();

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "xt" if info_hash.is_none() => {
                info_hash = Some(parse_xt(&value)?);
            }
            "dn" if display_name.is_none() => {
                display_name = Some(value.into_owned());
            }
            "tr" => trackers.push(value.into_owned()),
            "ws" => web_seeds.push(value.into_owned()),
            _ => {}
        }
    }

    let info_hash = info_hash.ok_or_else(|| {
        MetainfoError::InvalidMagnet("missing xt=urn:btih: parameter".into())
    })?;

    Ok(MagnetLink {
        info_hash,
        display_name,
        trackers,
        web_seeds,
    })
}

fn parse_xt(xt: &str) -> Result<InfoHash, MetainfoError> {
    let btih = xt
        .strip_prefix("urn:btih:")
        .or_else(|| xt.strip_prefix("urn:btmh:"))
        .ok_or_else(|| MetainfoError::InvalidMagnet(format!("unsupported xt value: {}", xt)))?;
    let bytes = decode_btih(btih)?;
    match bytes.len() {
        20 => {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&bytes);
            Ok(InfoHash::V1(hash))
        }
        32 => {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&bytes);
            Ok(InfoHash::V2(hash))
        }
        other => Err(MetainfoError::InvalidInfoHashLength(other)),
    }
}

/// A btih value is either hex (40 or 64 chars) or base32 (32 or 52 chars).
fn decode_btih(btih: &str) -> Result<Vec<u8>, MetainfoError> {
    let btih = btih.trim();
    let is_hex = btih.len() == 40 || btih.len() == 64;
    if is_hex {
        hex::decode(btih).map_err(|e| MetainfoError::InvalidMagnet(e.to_string()))
    } else {
        base32_decode(btih)
            .ok_or_else(|| MetainfoError::InvalidMagnet(format!("invalid base32 btih: {}", btih)))
    }
}

/// RFC 4648 base32 decoding (no padding), uppercase alphabet, as used by
/// magnet links' base32-encoded info hashes.
fn base32_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits: u64 = 0;
    let mut bit_count = 0u32;
    let mut out = Vec::new();
    for c in input.to_ascii_uppercase().bytes() {
        let value = ALPHABET.iter().position(|&b| b == c)? as u64;
        bits = (bits << 5) | value;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }
    Some(out)
}

/// Builds a placeholder announce URL list for a magnet-only torrent, before
/// metadata has been fetched: just the trackers named on the link itself.
pub fn trackers_from_link(link: &MagnetLink) -> Vec<String> {
    link.trackers.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_BTIH: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

    #[test]
    fn parses_hex_btih_with_tracker_and_name() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=Some+File&tr=http%3A%2F%2Ftracker.test%2Fannounce",
            HEX_BTIH
        );
        let link = parse(&uri).unwrap();
        assert_eq!(link.info_hash.as_v1().unwrap(), &hex::decode(HEX_BTIH).unwrap()[..]);
        assert_eq!(link.display_name.as_deref(), Some("Some File"));
        assert_eq!(link.trackers, vec!["http://tracker.test/announce"]);
    }

    #[test]
    fn parses_multiple_trackers_and_web_seeds() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&tr=http%3A%2F%2Fa.test%2F&tr=http%3A%2F%2Fb.test%2F&ws=http%3A%2F%2Fweb.test%2Ffile",
            HEX_BTIH
        );
        let link = parse(&uri).unwrap();
        assert_eq!(link.trackers.len(), 2);
        assert_eq!(link.web_seeds, vec!["http://web.test/file"]);
    }

    #[test]
    fn parses_base32_btih() {
        // Base32 encoding of the 20 zero bytes.
        let uri = "magnet:?xt=urn:btih:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        let link = parse(uri).unwrap();
        assert_eq!(link.info_hash.as_v1().unwrap(), &[0u8; 20]);
    }

    #[test]
    fn rejects_non_magnet_scheme() {
        assert!(parse("http://example.test/").is_err());
    }

    #[test]
    fn rejects_missing_xt() {
        assert!(parse("magnet:?dn=no-hash-here").is_err());
    }

    #[test]
    fn rejects_wrong_length_hash() {
        let uri = "magnet:?xt=urn:btih:aabbcc";
        assert!(parse(uri).is_err());
    }
}
