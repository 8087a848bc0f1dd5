//! The byte-exact wire codecs: the 68 byte BitTorrent handshake and the
//! length-prefixed peer messages, including the Fast extension (BEP 6),
//! the extended message envelope (BEP 10) and the v2 hash transfer
//! messages.
//!
//! Framing errors surface as `io::Error` with `InvalidData`; the peer
//! session maps them to a disconnect with the protocol-error reason.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash, BLOCK_LEN};

/// The protocol string the handshake leads with.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The handshake is always this long.
pub(crate) const HANDSHAKE_LEN: usize = 68;

/// No legal message is longer than this; a larger length prefix is a hard
/// protocol error.
pub(crate) const MAX_FRAME_LEN: u32 = 1024 * 1024;

// Reserved-bit positions we understand.
/// byte 5: the extension protocol (BEP 10)
const EXTENSIONS_BIT: u8 = 0x10;
/// byte 7: the DHT port message
const DHT_BIT: u8 = 0x01;
/// byte 7: the Fast extension (BEP 6)
const FAST_BIT: u8 = 0x04;
/// byte 7: hybrid v2 capability
const V2_BIT: u8 = 0x10;

/// The BitTorrent handshake: protocol identifier, reserved capability bits,
/// info hash, peer id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    /// The protocol string, always `BitTorrent protocol`.
    pub prot: [u8; 19],
    /// The reserved capability bitmap.
    pub reserved: [u8; 8],
    /// The torrent's SHA-1 info hash.
    pub info_hash: Sha1Hash,
    /// The peer's arbitrary id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates a handshake advertising the capabilities the engine
    /// implements: the extension protocol, the DHT port message and the
    /// Fast extension.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        reserved[5] |= EXTENSIONS_BIT;
        reserved[7] |= DHT_BIT;
        reserved[7] |= FAST_BIT;
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & EXTENSIONS_BIT != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & DHT_BIT != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[7] & FAST_BIT != 0
    }

    pub fn supports_v2(&self) -> bool {
        self.reserved[7] & V2_BIT != 0
    }

    /// Serializes the handshake into its 68 byte wire form.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.extend_from_slice(&self.prot);
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
    }
}

/// Codec for the handshake phase of a connection.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        handshake.encode(buf);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }
        // the protocol string length must be valid before we wait for the
        // rest of the handshake
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(invalid_data("invalid protocol identifier length"));
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(invalid_data("invalid protocol identifier"));
        }
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

/// The ids of the messages the engine speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    DhtPort = 9,
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    RejectRequest = 16,
    AllowedFast = 17,
    Extended = 20,
    HashRequest = 21,
    Hashes = 22,
    HashReject = 23,
}

impl MessageId {
    pub fn from_u8(id: u8) -> Option<Self> {
        use MessageId::*;
        let id = match id {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            9 => DhtPort,
            13 => Suggest,
            14 => HaveAll,
            15 => HaveNone,
            16 => RejectRequest,
            17 => AllowedFast,
            20 => Extended,
            21 => HashRequest,
            22 => Hashes,
            23 => HashReject,
            _ => return None,
        };
        Some(id)
    }
}

/// The header of the v2 hash transfer messages: which part of which merkle
/// tree is being requested or delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HashRequest {
    /// The root hash of the file's merkle tree.
    pub pieces_root: [u8; 32],
    /// The tree layer the request is relative to.
    pub base_layer: u32,
    /// The offset within the layer.
    pub index: u32,
    /// The number of hashes requested.
    pub count: u32,
    /// The number of ancestor (proof) layers to include.
    pub proof_layers: u32,
}

impl HashRequest {
    const LEN: usize = 32 + 4 * 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.pieces_root);
        buf.put_u32(self.base_layer);
        buf.put_u32(self.index);
        buf.put_u32(self.count);
        buf.put_u32(self.proof_layers);
    }

    fn decode(buf: &mut BytesMut) -> io::Result<Self> {
        if buf.remaining() < Self::LEN {
            return Err(invalid_data("hash request too short"));
        }
        let mut pieces_root = [0; 32];
        buf.copy_to_slice(&mut pieces_root);
        Ok(Self {
            pieces_root,
            base_layer: buf.get_u32(),
            index: buf.get_u32(),
            count: buf.get_u32(),
            proof_layers: buf.get_u32(),
        })
    }
}

/// A peer message, after framing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    DhtPort(u16),
    Suggest {
        piece_index: PieceIndex,
    },
    HaveAll,
    HaveNone,
    RejectRequest(BlockInfo),
    AllowedFast {
        piece_index: PieceIndex,
    },
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
    HashRequest(HashRequest),
    Hashes {
        request: HashRequest,
        hashes: Vec<[u8; 32]>,
    },
    HashReject(HashRequest),
}

impl Message {
    /// The message's wire id; `None` for keep-alives, which have none.
    pub fn id(&self) -> Option<MessageId> {
        use Message::*;
        let id = match self {
            KeepAlive => return None,
            Choke => MessageId::Choke,
            Unchoke => MessageId::Unchoke,
            Interested => MessageId::Interested,
            NotInterested => MessageId::NotInterested,
            Have { .. } => MessageId::Have,
            Bitfield(_) => MessageId::Bitfield,
            Request(_) => MessageId::Request,
            Piece { .. } => MessageId::Piece,
            Cancel(_) => MessageId::Cancel,
            DhtPort(_) => MessageId::DhtPort,
            Suggest { .. } => MessageId::Suggest,
            HaveAll => MessageId::HaveAll,
            HaveNone => MessageId::HaveNone,
            RejectRequest(_) => MessageId::RejectRequest,
            AllowedFast { .. } => MessageId::AllowedFast,
            Extended { .. } => MessageId::Extended,
            HashRequest(_) => MessageId::HashRequest,
            Hashes { .. } => MessageId::Hashes,
            HashReject(_) => MessageId::HashReject,
        };
        Some(id)
    }

    /// The number of payload bytes carried, for payload (as opposed to
    /// protocol chatter) accounting. Only piece messages carry payload.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Piece { data, .. } => data.len(),
            _ => 0,
        }
    }
}

fn encode_block_info(block: &BlockInfo, buf: &mut BytesMut) {
    buf.put_u32(block.piece_index as u32);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
}

fn decode_block_info(buf: &mut BytesMut) -> io::Result<BlockInfo> {
    if buf.remaining() < 12 {
        return Err(invalid_data("block info too short"));
    }
    Ok(BlockInfo {
        piece_index: buf.get_u32() as PieceIndex,
        offset: buf.get_u32(),
        len: buf.get_u32(),
    })
}

fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Codec for the message phase of a connection: `u32` big-endian length
/// prefix, `u8` message id, payload.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke | Unchoke | Interested | NotInterested | HaveAll
            | HaveNone => {
                buf.put_u32(1);
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Have { piece_index } | Suggest { piece_index }
            | AllowedFast { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(msg.id().unwrap() as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                let bytes = bitfield.as_slice();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(bytes);
            }
            Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                encode_block_info(&block, buf);
            }
            Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                encode_block_info(&block, buf);
            }
            RejectRequest(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::RejectRequest as u8);
                encode_block_info(&block, buf);
            }
            Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            DhtPort(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::DhtPort as u8);
                buf.put_u16(port);
            }
            Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.extend_from_slice(&payload);
            }
            HashRequest(request) => {
                buf.put_u32(1 + crate::peer::codec::HashRequest::LEN as u32);
                buf.put_u8(MessageId::HashRequest as u8);
                request.encode(buf);
            }
            Hashes { request, hashes } => {
                buf.put_u32(
                    1 + crate::peer::codec::HashRequest::LEN as u32 + 32 * hashes.len() as u32,
                );
                buf.put_u8(MessageId::Hashes as u8);
                request.encode(buf);
                for hash in &hashes {
                    buf.extend_from_slice(hash);
                }
            }
            HashReject(request) => {
                buf.put_u32(1 + crate::peer::codec::HashRequest::LEN as u32);
                buf.put_u8(MessageId::HashReject as u8);
                request.encode(buf);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.remaining() < 4 {
            return Ok(None);
        }
        // peek the length prefix without consuming it, in case the frame
        // hasn't fully arrived
        let mut peek = [0; 4];
        peek.copy_from_slice(&buf[..4]);
        let frame_len = u32::from_be_bytes(peek);

        if frame_len > MAX_FRAME_LEN {
            return Err(invalid_data("frame exceeds maximum message size"));
        }
        if buf.remaining() < 4 + frame_len as usize {
            return Ok(None);
        }
        buf.advance(4);

        if frame_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = buf.get_u8();
        let payload_len = frame_len as usize - 1;
        let id = MessageId::from_u8(id)
            .ok_or_else(|| invalid_data("unknown message id"))?;

        use MessageId::*;
        let len_ok = match id {
            Choke | Unchoke | Interested | NotInterested | HaveAll
            | HaveNone => payload_len == 0,
            Have | Suggest | AllowedFast => payload_len == 4,
            Request | Cancel | RejectRequest => payload_len == 12,
            DhtPort => payload_len == 2,
            Piece => payload_len >= 8,
            Bitfield => true,
            Extended => payload_len >= 1,
            HashRequest | HashReject => payload_len == crate::peer::codec::HashRequest::LEN,
            Hashes => payload_len >= crate::peer::codec::HashRequest::LEN,
        };
        if !len_ok {
            return Err(invalid_data("message length doesn't match its id"));
        }

        let msg = match id {
            Choke => Message::Choke,
            Unchoke => Message::Unchoke,
            Interested => Message::Interested,
            NotInterested => Message::NotInterested,
            Have => Message::Have {
                piece_index: buf.get_u32() as PieceIndex,
            },
            Bitfield => {
                let bytes = buf.split_to(payload_len);
                Message::Bitfield(crate::Bitfield::from_vec(bytes.to_vec()))
            }
            Request => Message::Request(decode_block_info(buf)?),
            Piece => {
                if payload_len < 8 {
                    return Err(invalid_data("piece message too short"));
                }
                let data_len = payload_len - 8;
                if data_len > BLOCK_LEN as usize {
                    return Err(invalid_data("piece payload exceeds block size"));
                }
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let data = buf.split_to(data_len).to_vec();
                Message::Piece {
                    piece_index,
                    offset,
                    data,
                }
            }
            Cancel => Message::Cancel(decode_block_info(buf)?),
            DhtPort => Message::DhtPort(buf.get_u16()),
            Suggest => Message::Suggest {
                piece_index: buf.get_u32() as PieceIndex,
            },
            HaveAll => Message::HaveAll,
            HaveNone => Message::HaveNone,
            RejectRequest => Message::RejectRequest(decode_block_info(buf)?),
            AllowedFast => Message::AllowedFast {
                piece_index: buf.get_u32() as PieceIndex,
            },
            Extended => {
                if payload_len < 1 {
                    return Err(invalid_data("extended message too short"));
                }
                let id = buf.get_u8();
                let payload = buf.split_to(payload_len - 1).to_vec();
                Message::Extended { id, payload }
            }
            HashRequest => Message::HashRequest(crate::peer::codec::HashRequest::decode(buf)?),
            Hashes => {
                let request = crate::peer::codec::HashRequest::decode(buf)?;
                let hashes_len = payload_len - crate::peer::codec::HashRequest::LEN;
                if hashes_len % 32 != 0 {
                    return Err(invalid_data("truncated hash list"));
                }
                let mut hashes = Vec::with_capacity(hashes_len / 32);
                for _ in 0..hashes_len / 32 {
                    let mut hash = [0; 32];
                    buf.copy_to_slice(&mut hash);
                    hashes.push(hash);
                }
                Message::Hashes { request, hashes }
            }
            HashReject => Message::HashReject(crate::peer::codec::HashRequest::decode(buf)?),
        };
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_block() -> BlockInfo {
        BlockInfo {
            piece_index: 42,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        }
    }

    fn test_hash_request() -> HashRequest {
        HashRequest {
            pieces_root: [7; 32],
            base_layer: 2,
            index: 512,
            count: 64,
            proof_layers: 3,
        }
    }

    #[test]
    fn test_handshake_roundtrip() {
        let handshake = Handshake::new([0xaa; 20], *b"-rp0100-abcdefghijkl");
        assert!(handshake.supports_extensions());
        assert!(handshake.supports_dht());
        assert!(handshake.supports_fast());
        assert!(!handshake.supports_v2());

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_decode_needs_full_frame() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        let mut partial = buf.split_to(HANDSHAKE_LEN - 1);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_handshake_rejects_wrong_protocol() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.extend_from_slice(b"BitTorrent protocoX");
        buf.extend_from_slice(&[0; 8 + 20 + 20]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_message_roundtrips() {
        let mut bitfield = Bitfield::from_vec(vec![0b1100_0001]);
        bitfield.resize(8, false);

        let messages = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece_index: 9 },
            Message::Bitfield(bitfield),
            Message::Request(test_block()),
            Message::Piece {
                piece_index: 3,
                offset: 2 * BLOCK_LEN,
                data: vec![0xfe; BLOCK_LEN as usize],
            },
            Message::Cancel(test_block()),
            Message::DhtPort(6881),
            Message::Suggest { piece_index: 1 },
            Message::HaveAll,
            Message::HaveNone,
            Message::RejectRequest(test_block()),
            Message::AllowedFast { piece_index: 4 },
            Message::Extended {
                id: 0,
                payload: b"d1:md11:ut_holepunchi4eee".to_vec(),
            },
            Message::HashRequest(test_hash_request()),
            Message::Hashes {
                request: test_hash_request(),
                hashes: vec![[1; 32], [2; 32]],
            },
            Message::HashReject(test_hash_request()),
        ];

        for msg in messages {
            let mut buf = BytesMut::new();
            PeerCodec.encode(msg.clone(), &mut buf).unwrap();
            let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg);
            assert!(buf.is_empty(), "{:?} left bytes in the buffer", decoded);
        }
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Request(test_block()), &mut buf)
            .unwrap();
        let total = buf.len();
        let mut partial = buf.split_to(total - 1);
        assert!(PeerCodec.decode(&mut partial).unwrap().is_none());
        // the remaining byte completes the frame
        partial.unsplit(buf);
        assert_eq!(
            PeerCodec.decode(&mut partial).unwrap().unwrap(),
            Message::Request(test_block())
        );
    }

    #[test]
    fn test_oversized_frame_is_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_piece_payload_is_error() {
        let mut buf = BytesMut::new();
        let data_len = BLOCK_LEN as usize + 1;
        buf.put_u32(9 + data_len as u32);
        buf.put_u8(MessageId::Piece as u8);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.extend_from_slice(&vec![0; data_len]);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_unknown_id_is_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(11);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }
}
