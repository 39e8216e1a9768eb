//! Parsing of `.torrent` files (BEP 3) into typed metadata.
//!
//! Typed decoding of most fields is delegated to `serde_bencode`, but the
//! info hash is computed from the literal byte span of the `info`
//! dictionary as it appeared in the source (via [`crate::bencode`]) rather
//! than from a re-encoded copy of the deserialized struct. A `.torrent`
//! file that doesn't encode its `info` dict in canonical key order (rare,
//! but not forbidden by BEP 3) would otherwise hash to the wrong value
//! and desync from every other client on the swarm.

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{bencode, error::MetainfoError, FileIndex, Sha1Hash};

/// A fully parsed `.torrent` file: the info dictionary plus the tracker and
/// descriptive metadata that sits alongside it.
#[derive(Debug, Clone, Deserialize)]
pub struct Metainfo {
    pub info: Info,

    /// The tracker URL to announce to. Absent for pure DHT/PEX torrents,
    /// though in practice almost every `.torrent` file sets this.
    pub announce: Option<String>,

    /// Tiered list of fallback trackers (BEP 12). Tiers are tried in
    /// order; within a tier, trackers are tried in random order.
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,

    pub comment: Option<String>,

    #[serde(rename = "created by")]
    pub created_by: Option<String>,

    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    pub encoding: Option<String>,

    /// Web seed URLs (BEP 19).
    #[serde(rename = "url-list")]
    pub url_list: Option<UrlList>,
}

/// `url-list` may be a single string or a list of strings in the wild.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UrlList {
    Single(String),
    Many(Vec<String>),
}

impl UrlList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            UrlList::Single(s) => vec![s],
            UrlList::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Info {
    pub name: String,

    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(rename = "piece length")]
    pub piece_length: u64,

    /// Present for single-file torrents, absent for multi-file ones.
    pub length: Option<u64>,

    /// Present for multi-file torrents, absent for single-file ones.
    pub files: Option<Vec<File>>,

    /// `1` if this torrent should only ever be found via its own tracker
    /// (no DHT, no PEX).
    pub private: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: u64,

    /// BEP 47 padding-file attribute string, when present.
    #[serde(default)]
    pub attr: Option<String>,
}

impl Metainfo {
    /// Parses a `.torrent` file's raw bytes.
    ///
    /// The info hash is derived separately via [`Metainfo::info_hash`] from
    /// the same `buf`, since it needs the original byte span rather than
    /// the deserialized struct.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, MetainfoError> {
        let metainfo: Self = serde_bencode::from_bytes(buf)
            .map_err(|e| MetainfoError::InvalidMagnet(e.to_string()))?;
        metainfo.validate()?;
        Ok(metainfo)
    }

    fn validate(&self) -> Result<(), MetainfoError> {
        if self.info.pieces.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPiecesLength(self.info.pieces.len()));
        }
        match (&self.info.length, &self.info.files) {
            (None, None) => return Err(MetainfoError::MissingField("length|files")),
            (Some(_), Some(_)) => {
                return Err(MetainfoError::InvalidMagnet(
                    "info dict has both `length` and `files`".into(),
                ))
            }
            _ => {}
        }
        if matches!(&self.info.files, Some(files) if files.is_empty()) {
            return Err(MetainfoError::NoFiles);
        }
        Ok(())
    }

    /// Computes the info hash from the literal bencoded span of the `info`
    /// dictionary in `buf`, the original source bytes this `Metainfo` was
    /// parsed from.
    ///
    /// Callers must pass the same `buf` used in [`Metainfo::from_bytes`];
    /// it will not silently produce a wrong-but-successful hash as long as
    /// `buf` still decodes and still contains an `info` key.
    pub fn info_hash(buf: &[u8]) -> Result<Sha1Hash, MetainfoError> {
        let span =
            bencode::raw_field_span(buf, b"info")?.ok_or(MetainfoError::MissingField("info"))?;
        let digest = Sha1::digest(span);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        Ok(hash)
    }

    /// The number of pieces described by this torrent.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// The SHA-1 hash of the piece at `index`.
    pub fn piece_hash(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(20)?;
        self.info.pieces.get(start..start + 20)
    }

    /// The total length of the torrent's content, in bytes.
    pub fn total_len(&self) -> u64 {
        match (&self.info.length, &self.info.files) {
            (Some(len), None) => *len,
            (None, Some(files)) => files.iter().map(|f| f.length).sum(),
            _ => 0,
        }
    }

    /// The number of files this torrent contains (1 for single-file
    /// torrents).
    pub fn file_count(&self) -> FileIndex {
        match &self.info.files {
            Some(files) => files.len(),
            None => 1,
        }
    }
}

// Re-exported so downstream callers constructing synthetic metainfo (e.g.
// from magnet + fetched metadata) don't need a direct `serde_bytes`
// dependency of their own.
pub use ByteBuf as RawBytes;

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent() -> Vec<u8> {
        let info = b"d6:lengthi11e4:name8:test.txt12:piece lengthi16384e6:pieces20:01234567890123456789e";
        let mut out = Vec::new();
        out.extend_from_slice(b"d8:announce20:http://tracker.test/4:info");
        out.extend_from_slice(info);
        out.extend_from_slice(b"e");
        out
    }

    #[test]
    fn parses_single_file_torrent() {
        let buf = single_file_torrent();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.info.name, "test.txt");
        assert_eq!(metainfo.info.length, Some(11));
        assert!(metainfo.info.files.is_none());
        assert_eq!(metainfo.total_len(), 11);
        assert_eq!(metainfo.piece_count(), 1);
        assert_eq!(metainfo.announce.as_deref(), Some("http://tracker.test/"));
    }

    #[test]
    fn rejects_invalid_pieces_length() {
        let info = b"d6:lengthi11e4:name8:test.txt12:piece lengthi16384e6:pieces5:abcdee";
        let mut out = Vec::new();
        out.extend_from_slice(b"d4:info");
        out.extend_from_slice(info);
        out.extend_from_slice(b"e");
        let err = Metainfo::from_bytes(&out).unwrap_err();
        assert!(matches!(err, MetainfoError::InvalidPiecesLength(5)));
    }

    #[test]
    fn info_hash_is_stable_regardless_of_sibling_field_order() {
        let buf = single_file_torrent();
        let hash_a = Metainfo::info_hash(&buf).unwrap();

        // Reorder top-level keys (comment now precedes info): the info
        // hash must not change, since it only depends on the `info` span.
        let info = b"d6:lengthi11e4:name8:test.txt12:piece lengthi16384e6:pieces20:01234567890123456789e";
        let mut reordered = Vec::new();
        reordered.extend_from_slice(b"d7:comment4:test8:announce20:http://tracker.test/4:info");
        reordered.extend_from_slice(info);
        reordered.extend_from_slice(b"e");
        let hash_b = Metainfo::info_hash(&reordered).unwrap();

        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn multi_file_torrent_sums_lengths() {
        let buf = b"d4:infod5:filesld6:lengthi5e4:pathl5:a.txteed6:lengthi7e4:pathl5:b.txteee4:name3:dir12:piece lengthi16384e6:pieces20:01234567890123456789ee";
        let metainfo = Metainfo::from_bytes(buf).unwrap();
        assert_eq!(metainfo.total_len(), 12);
        assert_eq!(metainfo.file_count(), 2);
    }
}
