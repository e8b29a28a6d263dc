//! The BitTorrent wire protocol codec: the initial fixed-length handshake
//! and the length-prefixed message stream that follows it (§4.4, §6).
//!
//! Grounded on the `tokio_util::codec::{Decoder, Encoder}` shape used by
//! `examples/winQe-torrent_rs/src/message/codec.rs` (the only codec in the
//! retrieval pack built on the same `tokio_util` family the teacher uses),
//! adapted to bytes 0.5's `Buf`/`BufMut` (no `tokio_util::bytes`
//! re-export at this version) and extended with the symmetric `Encoder`
//! half the teacher's session needs to both send and receive.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PeerId, Sha1Hash};

/// `"BitTorrent protocol"`, the fixed protocol string in the handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

const HANDSHAKE_LEN: usize = 49 + PROTOCOL_STRING.len();

/// The fixed-length message exchanged first on every connection (§6):
/// `[pstrlen=19][protocol string][8 reserved bytes][20-byte infohash]
/// [20-byte peer id]`, 68 bytes total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub prot: [u8; PROTOCOL_STRING.len()],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; PROTOCOL_STRING.len()];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 1 {
            return Ok(None);
        }
        let pstrlen = src[0] as usize;
        let len = 1 + pstrlen + 8 + 20 + 20;
        if src.len() < len {
            return Ok(None);
        }

        src.advance(1);
        let mut prot = [0; PROTOCOL_STRING.len()];
        if pstrlen != PROTOCOL_STRING.len() {
            // consume the whole malformed handshake so the connection can
            // be cleanly torn down rather than left desynced.
            src.advance(len - 1);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid protocol string length",
            ));
        }
        src.copy_to_slice(&mut prot);

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = std::io::Error;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(handshake.prot.len() as u8);
        dst.put_slice(&handshake.prot);
        dst.put_slice(&handshake.reserved);
        dst.put_slice(&handshake.info_hash);
        dst.put_slice(&handshake.peer_id);
        Ok(())
    }
}

/// The id byte identifying a post-handshake message (§6). `Keepalive` has
/// no id on the wire (it's the zero-length message).
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
}

/// A post-handshake wire message (§4.4, §6).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: usize },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: usize,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the message's id, or `None` for `Keepalive`.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

/// Messages larger than this are rejected rather than buffered, guarding
/// against a peer claiming an absurd length prefix. Generous enough for a
/// full 16 KiB block plus its 9-byte header.
const MAX_MESSAGE_LEN: usize = 64 * 1024;

pub(crate) struct PeerCodec;

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_MESSAGE_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("message length {} exceeds maximum", len),
            ));
        }
        if src.len() < 4 + len {
            // reserve the rest up front so repeated partial reads of a
            // large block payload don't reallocate the buffer each time.
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = src[0];
        src.advance(1);
        let payload_len = len - 1;

        let message = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                let piece_index = src.get_u32() as usize;
                Message::Have { piece_index }
            }
            5 => {
                let bytes = src.split_to(payload_len);
                Message::Bitfield(Bitfield::from_vec(bytes.to_vec()))
            }
            6 => {
                let piece_index = src.get_u32() as usize;
                let offset = src.get_u32();
                let len = src.get_u32();
                Message::Request(BlockInfo {
                    piece_index,
                    offset,
                    len,
                })
            }
            7 => {
                let piece_index = src.get_u32() as usize;
                let offset = src.get_u32();
                let data = src.split_to(payload_len - 8).to_vec();
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            8 => {
                let piece_index = src.get_u32() as usize;
                let offset = src.get_u32();
                let len = src.get_u32();
                Message::Cancel(BlockInfo {
                    piece_index,
                    offset,
                    len,
                })
            }
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown message id {}", id),
                ))
            }
        };

        Ok(Some(message))
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = std::io::Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                dst.reserve(4);
                dst.put_u32(0);
            }
            Message::Choke => encode_empty(dst, MessageId::Choke),
            Message::Unchoke => encode_empty(dst, MessageId::Unchoke),
            Message::Interested => encode_empty(dst, MessageId::Interested),
            Message::NotInterested => encode_empty(dst, MessageId::NotInterested),
            Message::Have { piece_index } => {
                dst.reserve(4 + 1 + 4);
                dst.put_u32(1 + 4);
                dst.put_u8(MessageId::Have as u8);
                dst.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                dst.reserve(4 + 1 + bytes.len());
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.put_slice(&bytes);
            }
            Message::Request(block) => encode_block_info(dst, MessageId::Request, block),
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                dst.reserve(4 + 1 + 8 + data.len());
                dst.put_u32(1 + 8 + data.len() as u32);
                dst.put_u8(MessageId::Block as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.put_slice(&data);
            }
            Message::Cancel(block) => encode_block_info(dst, MessageId::Cancel, block),
        }
        Ok(())
    }
}

fn encode_empty(dst: &mut BytesMut, id: MessageId) {
    dst.reserve(4 + 1);
    dst.put_u32(1);
    dst.put_u8(id as u8);
}

fn encode_block_info(dst: &mut BytesMut, id: MessageId, block: BlockInfo) {
    dst.reserve(4 + 1 + 12);
    dst.put_u32(1 + 12);
    dst.put_u8(id as u8);
    dst.put_u32(block.piece_index as u32);
    dst.put_u32(block.offset);
    dst.put_u32(block.len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_round_trip() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_rejects_wrong_protocol_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(5);
        buf.put_slice(&[0; 5 + 8 + 20 + 20]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_keep_alive_round_trip() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap(),
            Some(Message::KeepAlive)
        );
    }

    #[test]
    fn test_bitfield_round_trip_byte_exact() {
        // N=13 pieces, owned {0, 3, 12}: byte 0 = 0b1001_0000 (pieces 0-7,
        // MSB first), byte 1 = 0b0000_1000 (pieces 8-12, piece 12 is bit
        // index 4 of the second byte) -> 0x90 0x08.
        let mut bitfield = Bitfield::repeat(false, 13);
        bitfield.set(0, true);
        bitfield.set(3, true);
        bitfield.set(12, true);

        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Bitfield(bitfield.clone()), &mut buf)
            .unwrap();
        // length prefix (1 + 2) + id + 2 payload bytes
        assert_eq!(&buf[..], &[0, 0, 0, 3, 5, 0x90, 0x08]);

        match PeerCodec.decode(&mut buf).unwrap().unwrap() {
            Message::Bitfield(decoded) => assert_eq!(decoded, bitfield),
            other => panic!("expected Bitfield, got {:?}", other),
        }
    }

    #[test]
    fn test_request_round_trip() {
        let block = BlockInfo {
            piece_index: 7,
            offset: 0x4000,
            len: 0x4000,
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(block), &mut buf).unwrap();
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap(),
            Some(Message::Request(block))
        );
    }

    #[test]
    fn test_block_round_trip() {
        let msg = Message::Block {
            piece_index: 2,
            offset: 0,
            data: vec![1, 2, 3, 4, 5],
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_incomplete_message_returns_none() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(4); // Have's id, but missing its 4-byte payload
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversize_length_prefix_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_MESSAGE_LEN + 1) as u32);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_unknown_message_id_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(255);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }
}
