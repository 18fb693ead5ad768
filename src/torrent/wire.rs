//! Peer wire codec
//!
//! Fixed-layout records and message framing for the BitTorrent peer
//! protocol (BEP 3). Every field is a machine integer in network byte order
//! or a fixed-size byte array; framed messages are
//! `<u32 length><u8 id><payload[length - 1]>`, where a zero length is a
//! keep-alive with no id byte at all.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result};
use crate::torrent::metainfo::Sha1Hash;

/// Protocol identifier carried in every handshake
pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Size of the handshake record: 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_LEN: usize = 68;

/// Cap on a single framed payload. The largest legitimate message is a
/// piece block (16 KiB) plus header; 256 KiB leaves generous slack while
/// still rejecting nonsense lengths.
pub const MAX_PAYLOAD_LEN: usize = 256 * 1024;

/// Reserved byte carrying the extension-protocol bit (BEP 10)
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

/// The 68-byte connection preamble
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Build an outgoing handshake advertising extension-protocol support
    pub fn new(info_hash: Sha1Hash, peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the sender supports the extension protocol (BEP 10)
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    /// Serialize to the 68-byte wire layout
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parse the 68-byte wire layout, validating the protocol string
    pub fn decode(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self> {
        if buf[0] as usize != PROTOCOL_STRING.len() || &buf[1..20] != PROTOCOL_STRING {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                "invalid protocol string in handshake",
            ));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

/// Peer wire protocol messages, one variant per message id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Zero-length frame; ignorable
    KeepAlive,
    /// id 0
    Choke,
    /// id 1
    Unchoke,
    /// id 2
    Interested,
    /// id 3
    NotInterested,
    /// id 4: sender now has this piece
    Have { index: u32 },
    /// id 5: full piece set, one bit per piece, MSB-first within bytes
    Bitfield { bits: Vec<u8> },
    /// id 6: ask for a block
    Request { index: u32, begin: u32, length: u32 },
    /// id 7: a block of piece data
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// id 8: withdraw an earlier request
    Cancel { index: u32, begin: u32, length: u32 },
    /// id 9: DHT port; ignored
    Port { port: u16 },
    /// id 20: extension protocol envelope (BEP 10)
    Extended { ext_id: u8, payload: Vec<u8> },
    /// Anything else; carried so the loop can skip it
    Unknown { id: u8, payload: Vec<u8> },
}

impl PeerMessage {
    /// Encode with length prefix
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => vec![0, 0, 0, 0],
            Self::Choke => vec![0, 0, 0, 1, 0],
            Self::Unchoke => vec![0, 0, 0, 1, 1],
            Self::Interested => vec![0, 0, 0, 1, 2],
            Self::NotInterested => vec![0, 0, 0, 1, 3],

            Self::Have { index } => {
                let mut buf = vec![0, 0, 0, 5, 4];
                buf.extend_from_slice(&index.to_be_bytes());
                buf
            }

            Self::Bitfield { bits } => {
                let len = 1 + bits.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(5);
                buf.extend_from_slice(bits);
                buf
            }

            Self::Request {
                index,
                begin,
                length,
            } => encode_triple(6, *index, *begin, *length),

            Self::Piece {
                index,
                begin,
                block,
            } => {
                let len = 9 + block.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(7);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }

            Self::Cancel {
                index,
                begin,
                length,
            } => encode_triple(8, *index, *begin, *length),

            Self::Port { port } => {
                let mut buf = vec![0, 0, 0, 3, 9];
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }

            Self::Extended { ext_id, payload } => {
                let len = 2 + payload.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(20);
                buf.push(*ext_id);
                buf.extend_from_slice(payload);
                buf
            }

            Self::Unknown { id, payload } => {
                let len = 1 + payload.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(*id);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    /// Decode a frame body (id byte plus payload, no length prefix).
    ///
    /// An empty body is a keep-alive.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(Self::KeepAlive);
        }

        let id = body[0];
        let payload = &body[1..];

        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),

            4 => {
                let index = read_u32(payload, 0, "have")?;
                Ok(Self::Have { index })
            }

            5 => Ok(Self::Bitfield {
                bits: payload.to_vec(),
            }),

            6 => Ok(Self::Request {
                index: read_u32(payload, 0, "request")?,
                begin: read_u32(payload, 4, "request")?,
                length: read_u32(payload, 8, "request")?,
            }),

            7 => {
                if payload.len() < 8 {
                    return Err(framing_error("piece message too short"));
                }
                Ok(Self::Piece {
                    index: read_u32(payload, 0, "piece")?,
                    begin: read_u32(payload, 4, "piece")?,
                    block: payload[8..].to_vec(),
                })
            }

            8 => Ok(Self::Cancel {
                index: read_u32(payload, 0, "cancel")?,
                begin: read_u32(payload, 4, "cancel")?,
                length: read_u32(payload, 8, "cancel")?,
            }),

            9 => {
                if payload.len() < 2 {
                    return Err(framing_error("port message too short"));
                }
                Ok(Self::Port {
                    port: u16::from_be_bytes([payload[0], payload[1]]),
                })
            }

            20 => {
                if payload.is_empty() {
                    return Err(framing_error("extended message missing ext id"));
                }
                Ok(Self::Extended {
                    ext_id: payload[0],
                    payload: payload[1..].to_vec(),
                })
            }

            _ => Ok(Self::Unknown {
                id,
                payload: payload.to_vec(),
            }),
        }
    }
}

fn encode_triple(id: u8, index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut buf = vec![0, 0, 0, 13, id];
    buf.extend_from_slice(&index.to_be_bytes());
    buf.extend_from_slice(&begin.to_be_bytes());
    buf.extend_from_slice(&length.to_be_bytes());
    buf
}

fn read_u32(payload: &[u8], offset: usize, what: &str) -> Result<u32> {
    payload
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| framing_error(format!("{} message too short", what)))
}

fn framing_error(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::PeerProtocol, message)
}

/// Read one framed message, enforcing a read deadline.
///
/// Blocks until a full message arrives or the deadline expires; expiry
/// surfaces as a retryable timeout error.
pub async fn read_message<R>(
    stream: &mut R,
    buf: &mut BytesMut,
    deadline: Duration,
) -> Result<PeerMessage>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    read_exact_deadline(stream, &mut len_buf, deadline).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len == 0 {
        return Ok(PeerMessage::KeepAlive);
    }
    if len > MAX_PAYLOAD_LEN {
        return Err(framing_error(format!("message of {} bytes exceeds cap", len)));
    }

    buf.resize(len, 0);
    read_exact_deadline(stream, buf, deadline).await?;
    PeerMessage::decode(buf)
}

/// Write one framed message
pub async fn write_message<W>(stream: &mut W, msg: &PeerMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&msg.encode()).await.map_err(|e| {
        EngineError::network(
            NetworkErrorKind::ConnectionReset,
            format!("send failed: {}", e),
        )
    })
}

async fn read_exact_deadline<R>(stream: &mut R, buf: &mut [u8], deadline: Duration) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    timeout(deadline, stream.read_exact(buf))
        .await
        .map_err(|_| EngineError::network(NetworkErrorKind::Timeout, "read deadline expired"))?
        .map_err(|e| {
            EngineError::network(
                NetworkErrorKind::ConnectionReset,
                format!("read failed: {}", e),
            )
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: PeerMessage) {
        let encoded = msg.encode();
        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(len, encoded.len() - 4);
        let decoded = PeerMessage::decode(&encoded[4..]).unwrap();
        assert_eq!(decoded, msg);
        // Bit-for-bit: re-encoding yields the original bytes
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn test_message_roundtrip() {
        roundtrip(PeerMessage::Choke);
        roundtrip(PeerMessage::Unchoke);
        roundtrip(PeerMessage::Interested);
        roundtrip(PeerMessage::NotInterested);
        roundtrip(PeerMessage::Have { index: 42 });
        roundtrip(PeerMessage::Bitfield {
            bits: vec![0b1010_1010, 0b0100_0000],
        });
        roundtrip(PeerMessage::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        });
        roundtrip(PeerMessage::Piece {
            index: 3,
            begin: 0,
            block: vec![7; 512],
        });
        roundtrip(PeerMessage::Cancel {
            index: 1,
            begin: 0,
            length: 16384,
        });
        roundtrip(PeerMessage::Port { port: 6881 });
        roundtrip(PeerMessage::Extended {
            ext_id: 2,
            payload: b"d8:msg_typei0e5:piecei0ee".to_vec(),
        });
    }

    #[test]
    fn test_keepalive() {
        assert_eq!(PeerMessage::KeepAlive.encode(), vec![0, 0, 0, 0]);
        assert_eq!(PeerMessage::decode(&[]).unwrap(), PeerMessage::KeepAlive);
    }

    #[test]
    fn test_handshake_roundtrip() {
        let hs = Handshake::new([0xAB; 20], *b"-MD0001-abcdefghijkl");
        let encoded = hs.encode();
        assert_eq!(encoded.len(), HANDSHAKE_LEN);
        assert_eq!(encoded[0], 19);

        let decoded = Handshake::decode(&encoded).unwrap();
        assert_eq!(decoded, hs);
        assert!(decoded.supports_extensions());
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn test_handshake_without_extension_bit() {
        let mut hs = Handshake::new([1; 20], [2; 20]);
        hs.reserved = [0; 8];
        assert!(!hs.supports_extensions());
    }

    #[test]
    fn test_handshake_rejects_wrong_protocol() {
        let hs = Handshake::new([0; 20], [0; 20]);
        let mut encoded = hs.encode();
        encoded[1] = b'X';
        assert!(Handshake::decode(&encoded).is_err());
        encoded[1] = b'B';
        encoded[0] = 18;
        assert!(Handshake::decode(&encoded).is_err());
    }

    #[test]
    fn test_short_payloads_rejected() {
        assert!(PeerMessage::decode(&[4, 0, 0]).is_err()); // have needs 4 bytes
        assert!(PeerMessage::decode(&[6, 0, 0, 0, 1]).is_err()); // request needs 12
        assert!(PeerMessage::decode(&[7, 0, 0, 0, 1]).is_err()); // piece needs 8
        assert!(PeerMessage::decode(&[20]).is_err()); // extended needs ext id
    }

    #[test]
    fn test_unknown_id_is_carried() {
        let decoded = PeerMessage::decode(&[99, 1, 2, 3]).unwrap();
        assert_eq!(
            decoded,
            PeerMessage::Unknown {
                id: 99,
                payload: vec![1, 2, 3]
            }
        );
    }

    #[tokio::test]
    async fn test_framed_read_write() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = PeerMessage::Piece {
            index: 9,
            begin: 16384,
            block: vec![3; 100],
        };
        write_message(&mut a, &msg).await.unwrap();

        let mut buf = BytesMut::new();
        let got = read_message(&mut b, &mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_read_deadline_expires() {
        let (_a, mut b) = tokio::io::duplex(64);
        let mut buf = BytesMut::new();
        let err = read_message(&mut b, &mut buf, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let huge = (MAX_PAYLOAD_LEN as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &huge).await.unwrap();

        let mut buf = BytesMut::new();
        let err = read_message(&mut b, &mut buf, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
