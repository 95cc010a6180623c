use super::error::PeerError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// The protocol identifier sent in every handshake.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
/// Handshake length: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LEN: usize = 68;

/// Wire message IDs. Each framed message (except keep-alive) starts with
/// one of these after the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            other => Err(PeerError::UnknownMessageId(other)),
        }
    }
}

/// The 68-byte opening exchange: protocol string, reserved bytes, the
/// torrent's info-hash and the sender's peer ID.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            info_hash,
            peer_id,
            reserved: [0u8; 8],
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake);
        }
        if data[0] as usize != PROTOCOL.len() || &data[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// A peer wire message: 4-byte big-endian length prefix, then a 1-byte ID
/// and payload. A zero-length frame is a keep-alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// Encodes the message, length prefix included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => Self::put_bare(&mut buf, MessageId::Choke),
            Message::Unchoke => Self::put_bare(&mut buf, MessageId::Unchoke),
            Message::Interested => Self::put_bare(&mut buf, MessageId::Interested),
            Message::NotInterested => Self::put_bare(&mut buf, MessageId::NotInterested),
            Message::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => Self::put_triple(&mut buf, MessageId::Request, *index, *begin, *length),
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => Self::put_triple(&mut buf, MessageId::Cancel, *index, *begin, *length),
        }

        buf.freeze()
    }

    fn put_bare(buf: &mut BytesMut, id: MessageId) {
        buf.put_u32(1);
        buf.put_u8(id as u8);
    }

    fn put_triple(buf: &mut BytesMut, id: MessageId, index: u32, begin: u32, length: u32) {
        buf.put_u32(13);
        buf.put_u8(id as u8);
        buf.put_u32(index);
        buf.put_u32(begin);
        buf.put_u32(length);
    }

    /// Decodes one complete frame (length prefix included).
    ///
    /// Unknown message IDs surface as [`PeerError::UnknownMessageId`] so the
    /// transport can skip the frame; any other error means the stream is
    /// unparseable and the connection must drop.
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::InvalidMessage("frame shorter than prefix"));
        }

        let length = data.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if data.remaining() < length {
            return Err(PeerError::InvalidMessage("truncated frame"));
        }

        let id = MessageId::try_from(data.get_u8())?;
        let payload_len = length - 1;

        match id {
            MessageId::Choke => Self::expect_empty(payload_len, Message::Choke),
            MessageId::Unchoke => Self::expect_empty(payload_len, Message::Unchoke),
            MessageId::Interested => Self::expect_empty(payload_len, Message::Interested),
            MessageId::NotInterested => Self::expect_empty(payload_len, Message::NotInterested),
            MessageId::Have => {
                if payload_len != 4 {
                    return Err(PeerError::InvalidMessage("have payload"));
                }
                Ok(Message::Have {
                    piece: data.get_u32(),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield(data.copy_to_bytes(payload_len))),
            MessageId::Request => {
                if payload_len != 12 {
                    return Err(PeerError::InvalidMessage("request payload"));
                }
                Ok(Message::Request {
                    index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                })
            }
            MessageId::Piece => {
                if payload_len < 8 {
                    return Err(PeerError::InvalidMessage("piece payload"));
                }
                let index = data.get_u32();
                let begin = data.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    data: data.copy_to_bytes(payload_len - 8),
                })
            }
            MessageId::Cancel => {
                if payload_len != 12 {
                    return Err(PeerError::InvalidMessage("cancel payload"));
                }
                Ok(Message::Cancel {
                    index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                })
            }
        }
    }

    fn expect_empty(payload_len: usize, msg: Message) -> Result<Message, PeerError> {
        if payload_len != 0 {
            return Err(PeerError::InvalidMessage("unexpected payload"));
        }
        Ok(msg)
    }
}
