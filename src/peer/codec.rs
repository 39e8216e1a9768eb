//! The BitTorrent peer wire protocol: the handshake framing and the
//! length-prefixed message framing used for everything that follows it.
//!
//! Kept in the original shape (a `tokio_util::codec::{Encoder, Decoder}`
//! pair per framing stage), with the core message set extended to cover
//! the `Port` message (BEP 5) and the generic `Extended` message (BEP
//! 10), neither of which the original download-only session needed.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::PeerError, Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Reserved-byte bit for the extension protocol (BEP 10), the 5th byte
/// from the end of the 8 reserved bytes.
const EXTENSION_PROTOCOL_BIT: u8 = 0x10;
/// Reserved-byte bit for DHT support (BEP 5), the last reserved byte.
const DHT_BIT: u8 = 0x01;

/// The 68 byte BitTorrent handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        reserved[5] |= EXTENSION_PROTOCOL_BIT;
        reserved[7] |= DHT_BIT;
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[5] & EXTENSION_PROTOCOL_BIT != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & DHT_BIT != 0
    }
}

pub(crate) struct HandshakeCodec;

/// 1 (pstrlen) + 19 (pstr) + 8 (reserved) + 20 (info hash) + 20 (peer id).
const HANDSHAKE_LEN: usize = 68;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = PeerError;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<(), Self::Error> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(handshake.prot.len() as u8);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let pstrlen = buf[0] as usize;
        let total_len = 1 + pstrlen + 8 + 20 + 20;
        if buf.len() < total_len {
            return Ok(None);
        }
        buf.advance(1);
        let mut prot = [0; 19];
        if pstrlen != prot.len() {
            return Err(PeerError::UnexpectedMessage);
        }
        buf.copy_to_slice(&mut prot);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);
        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The numeric wire identifier of each peer message, used both when
/// framing outgoing messages and when reporting unexpected ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl std::convert::TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        Ok(match id {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Block,
            8 => Cancel,
            9 => Port,
            20 => Extended,
            _ => return Err(PeerError::UnexpectedMessage),
        })
    }
}

/// A single peer wire protocol message (BEP 3, plus the `Port` message
/// from BEP 5 and the generic extended message from BEP 10).
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block { piece_index: PieceIndex, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
    /// Advertises the local DHT node's UDP port (BEP 5).
    Port(u16),
    /// An extension-protocol message (BEP 10): `id` is the peer-assigned
    /// extended message id (1 for the handshake itself is reserved), and
    /// `payload` is the still-encoded bencoded dictionary plus any
    /// trailing binary data (ut_metadata piece payloads are appended
    /// after the bencoded header).
    Extended { id: u8, payload: Vec<u8> },
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Block { .. } => Some(MessageId::Block),
            Message::Cancel(_) => Some(MessageId::Cancel),
            Message::Port(_) => Some(MessageId::Port),
            Message::Extended { .. } => Some(MessageId::Extended),
        }
    }
}

/// A human-readable name for a message id, used only to label
/// [`PeerError::MalformedMessage`] without pulling the whole `Message`
/// value (which may not exist yet) into the error.
fn message_name(id: MessageId) -> &'static str {
    match id {
        MessageId::Choke => "choke",
        MessageId::Unchoke => "unchoke",
        MessageId::Interested => "interested",
        MessageId::NotInterested => "not_interested",
        MessageId::Have => "have",
        MessageId::Bitfield => "bitfield",
        MessageId::Request => "request",
        MessageId::Block => "block",
        MessageId::Cancel => "cancel",
        MessageId::Port => "port",
        MessageId::Extended => "extended",
    }
}

pub(crate) struct PeerCodec;

/// A length-prefixed message may not exceed this many bytes. Generous
/// enough for a block payload (16 KiB) plus framing overhead, but bounds
/// how much a malicious peer can make us buffer before we error out.
const MAX_MESSAGE_LEN: usize = 1 << 17;

impl Encoder<Message> for PeerCodec {
    type Error = PeerError;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(info.piece_index as u32);
                buf.put_u32(info.offset);
                buf.put_u32(info.len);
            }
            Message::Block { piece_index, offset, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(info.piece_index as u32);
                buf.put_u32(info.offset);
                buf.put_u32(info.len);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.put_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_MESSAGE_LEN {
            return Err(PeerError::RequestQueueFull);
        }
        if buf.len() < 4 + len {
            buf.reserve(4 + len - buf.len());
            return Ok(None);
        }
        buf.advance(4);
        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }
        let id = MessageId::try_from(buf[0])?;
        buf.advance(1);
        let payload_len = len - 1;
        // Every fixed-layout message has a minimum (here, exact) payload
        // size; a peer is untrusted input and a short frame must surface
        // as an error rather than underflow the arithmetic below or read
        // past what `payload_len` actually promised.
        let require = |min: usize| -> Result<(), PeerError> {
            if payload_len < min {
                Err(PeerError::MalformedMessage(message_name(id)))
            } else {
                Ok(())
            }
        };
        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                require(4)?;
                let piece_index = buf.get_u32() as PieceIndex;
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                let bytes = buf.split_to(payload_len).to_vec();
                Message::Bitfield(Bitfield::from_vec(bytes))
            }
            MessageId::Request => {
                require(12)?;
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let block_len = buf.get_u32();
                Message::Request(BlockInfo { piece_index, offset, len: block_len })
            }
            MessageId::Block => {
                require(8)?;
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let data = buf.split_to(payload_len - 8).to_vec();
                Message::Block { piece_index, offset, data }
            }
            MessageId::Cancel => {
                require(12)?;
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let block_len = buf.get_u32();
                Message::Cancel(BlockInfo { piece_index, offset, len: block_len })
            }
            MessageId::Port => {
                require(2)?;
                let port = buf.get_u16();
                Message::Port(port)
            }
            MessageId::Extended => {
                require(1)?;
                let ext_id = buf.get_u8();
                let payload = buf.split_to(payload_len - 1).to_vec();
                Message::Extended { id: ext_id, payload }
            }
        };
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips_through_codec() {
        let mut codec = HandshakeCodec;
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        codec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn handshake_advertises_extension_and_dht_bits() {
        let handshake = Handshake::new([0; 20], [0; 20]);
        assert!(handshake.supports_extension_protocol());
        assert!(handshake.supports_dht());
    }

    #[test]
    fn keep_alive_round_trips() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }

    #[test]
    fn block_message_round_trips() {
        let mut codec = PeerCodec;
        let msg = Message::Block {
            piece_index: 3,
            offset: 16384,
            data: vec![9; 100],
        };
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_returns_none_on_partial_message() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::Have as u8);
        // missing the 4 byte piece index
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn extended_message_round_trips() {
        let mut codec = PeerCodec;
        let msg = Message::Extended { id: 3, payload: vec![1, 2, 3] };
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    /// A malformed `Block` frame (`len` too short to carry the 8 byte
    /// piece index/offset header) must surface `MalformedMessage`
    /// instead of underflowing `payload_len - 8` and panicking in
    /// `split_to`.
    #[test]
    fn decode_rejects_undersized_block_frame_instead_of_panicking() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(5); // id + 4 bytes, four short of the 8 byte header
        buf.put_u8(MessageId::Block as u8);
        buf.put_u32(0);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, PeerError::MalformedMessage(_)));
    }

    /// A malformed `Extended` frame with no room for the extended message
    /// id must not underflow `payload_len - 1`.
    #[test]
    fn decode_rejects_undersized_extended_frame_instead_of_panicking() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(1); // id only, no extended message id byte
        buf.put_u8(MessageId::Extended as u8);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, PeerError::MalformedMessage(_)));
    }

    /// A short `Have` frame must error rather than panic in `get_u32`.
    #[test]
    fn decode_rejects_undersized_have_frame_instead_of_panicking() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(3); // id + 2 bytes, two short of the u32 piece index
        buf.put_u8(MessageId::Have as u8);
        buf.put_u16(0);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, PeerError::MalformedMessage(_)));
    }
}
