//! Metadata exchange (BEP 9 over BEP 10)
//!
//! Magnet links carry only the info hash; the info dictionary itself is
//! fetched from peers through the ut_metadata extension, 16 KiB pieces at a
//! time. The fetcher drives a single peer session: it answers the extended
//! handshake, requests pieces sequentially from 0, accumulates the raw
//! bytes, and verifies SHA-1 of the reassembled dict against the info hash
//! before decoding it.

use sha1::{Digest, Sha1};

use crate::error::{
    EngineError, IntegrityErrorKind, ProtocolErrorKind, Result,
};
use crate::torrent::bencode::{dict, BencodeValue};
use crate::torrent::metainfo::{Sha1Hash, TorrentInfo};
use crate::torrent::peer::PeerSession;
use crate::torrent::wire::PeerMessage;

/// Metadata piece size (16 KiB)
pub const METADATA_PIECE_SIZE: usize = 16384;

/// Extension name negotiated in the BEP 10 handshake
pub const METADATA_EXTENSION_NAME: &str = "ut_metadata";

/// The message id we advertise for ut_metadata
pub const OUR_METADATA_ID: u8 = 2;

/// ut_metadata message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    /// Ask for a piece
    Request = 0,
    /// A piece of metadata
    Data = 1,
    /// Peer will not serve metadata
    Reject = 2,
}

impl MetadataMessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Request),
            1 => Some(Self::Data),
            2 => Some(Self::Reject),
            _ => None,
        }
    }
}

/// A ut_metadata message: a bencoded header dict, followed for data
/// messages by the raw piece bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataMessage {
    pub msg_type: MetadataMessageType,
    pub piece: usize,
    /// Total metadata size; present in data messages
    pub total_size: Option<usize>,
    /// Raw piece bytes; present in data messages
    pub data: Option<Vec<u8>>,
}

impl MetadataMessage {
    pub fn request(piece: usize) -> Self {
        Self {
            msg_type: MetadataMessageType::Request,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn data(piece: usize, total_size: usize, data: Vec<u8>) -> Self {
        Self {
            msg_type: MetadataMessageType::Data,
            piece,
            total_size: Some(total_size),
            data: Some(data),
        }
    }

    pub fn reject(piece: usize) -> Self {
        Self {
            msg_type: MetadataMessageType::Reject,
            piece,
            total_size: None,
            data: None,
        }
    }

    /// Encode: bencoded dict, with raw piece bytes appended for data
    pub fn encode(&self) -> Vec<u8> {
        let mut entries = vec![
            ("msg_type", BencodeValue::Integer(self.msg_type as i64)),
            ("piece", BencodeValue::Integer(self.piece as i64)),
        ];
        if let Some(total_size) = self.total_size {
            entries.push(("total_size", BencodeValue::Integer(total_size as i64)));
        }

        let mut encoded = dict(entries).encode();
        if let Some(ref data) = self.data {
            encoded.extend_from_slice(data);
        }
        encoded
    }

    /// Parse the bencoded header; for data messages everything after the
    /// dict is the raw piece payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (header, consumed) = BencodeValue::decode_prefix(payload)?;

        let msg_type = header
            .get("msg_type")
            .and_then(|v| v.as_uint())
            .and_then(|v| MetadataMessageType::from_u8(v as u8))
            .ok_or_else(|| metadata_error("missing or invalid msg_type"))?;

        let piece = header
            .get("piece")
            .and_then(|v| v.as_uint())
            .map(|v| v as usize)
            .ok_or_else(|| metadata_error("missing or invalid piece"))?;

        let total_size = header
            .get("total_size")
            .and_then(|v| v.as_uint())
            .map(|v| v as usize);

        let data = if msg_type == MetadataMessageType::Data {
            Some(payload[consumed..].to_vec())
        } else {
            None
        };

        Ok(Self {
            msg_type,
            piece,
            total_size,
            data,
        })
    }
}

/// Build our extended-handshake payload advertising ut_metadata
pub fn extension_handshake_payload() -> Vec<u8> {
    dict([(
        "m",
        dict([(
            METADATA_EXTENSION_NAME,
            BencodeValue::Integer(OUR_METADATA_ID as i64),
        )]),
    )])
    .encode()
}

/// Extract the peer's ut_metadata message id from its extended handshake
pub fn parse_metadata_id(payload: &[u8]) -> Option<u8> {
    let value = BencodeValue::decode(payload).ok()?;
    value
        .get("m")?
        .get(METADATA_EXTENSION_NAME)
        .and_then(|v| v.as_uint())
        .map(|v| v as u8)
}

/// Drives the metadata exchange on one peer session
pub struct MetadataFetcher {
    info_hash: Sha1Hash,
    /// The message id the peer uses for ut_metadata; 0 until learned
    peer_metadata_id: u8,
    total_size: usize,
    buffer: Vec<u8>,
    current_piece: usize,
}

impl MetadataFetcher {
    pub fn new(info_hash: Sha1Hash) -> Self {
        Self {
            info_hash,
            peer_metadata_id: 0,
            total_size: 0,
            buffer: Vec::new(),
            current_piece: 0,
        }
    }

    /// Run the exchange until a verified info dict is decoded.
    ///
    /// Fails with a metadata protocol error when the peer cannot serve
    /// metadata (no extension support, no ut_metadata in its handshake, or
    /// an explicit reject) and with an integrity error when the reassembled
    /// dict does not hash to the info hash. Either way the peer is useless
    /// for this phase and the caller moves on to the next one.
    pub async fn fetch(mut self, session: &mut PeerSession) -> Result<TorrentInfo> {
        if !session.supports_extensions() {
            return Err(metadata_error("peer does not support the extension protocol"));
        }

        loop {
            let msg = session.recv().await?;
            let PeerMessage::Extended { ext_id, payload } = msg else {
                continue;
            };

            if ext_id == 0 {
                self.handle_extension_handshake(session, &payload).await?;
            } else if ext_id == OUR_METADATA_ID
                || (self.peer_metadata_id != 0 && ext_id == self.peer_metadata_id)
            {
                // BEP 10 says replies arrive under the id we advertised, but
                // some clients echo their own; accept both.
                if let Some(info) = self.handle_metadata_message(session, &payload).await? {
                    return Ok(info);
                }
            }
        }
    }

    async fn handle_extension_handshake(
        &mut self,
        session: &mut PeerSession,
        payload: &[u8],
    ) -> Result<()> {
        // Answer with our own handshake first
        session
            .send(PeerMessage::Extended {
                ext_id: 0,
                payload: extension_handshake_payload(),
            })
            .await?;

        match parse_metadata_id(payload) {
            Some(id) if id != 0 => {
                self.peer_metadata_id = id;
                self.request_piece(session, 0).await
            }
            _ => Err(metadata_error("peer does not advertise ut_metadata")),
        }
    }

    async fn request_piece(&self, session: &mut PeerSession, piece: usize) -> Result<()> {
        session
            .send(PeerMessage::Extended {
                ext_id: self.peer_metadata_id,
                payload: MetadataMessage::request(piece).encode(),
            })
            .await
    }

    /// Process one ut_metadata message. Returns the decoded info dict once
    /// the exchange is complete.
    async fn handle_metadata_message(
        &mut self,
        session: &mut PeerSession,
        payload: &[u8],
    ) -> Result<Option<TorrentInfo>> {
        let msg = MetadataMessage::parse(payload)?;

        match msg.msg_type {
            // We do not serve metadata
            MetadataMessageType::Request => Ok(None),

            MetadataMessageType::Reject => {
                Err(metadata_error("metadata request rejected by peer"))
            }

            MetadataMessageType::Data => {
                if msg.piece != self.current_piece {
                    return Err(metadata_error(format!(
                        "expected metadata piece {}, got {}",
                        self.current_piece, msg.piece
                    )));
                }
                let chunk = msg.data.unwrap_or_default();
                if self.total_size == 0 {
                    self.total_size = msg.total_size.unwrap_or(0);
                    if self.total_size == 0 {
                        return Err(metadata_error("data message missing total_size"));
                    }
                }

                self.buffer.extend_from_slice(&chunk);
                self.current_piece += 1;

                // Complete on a short chunk or once the declared size is
                // reached; exact multiples of 16 KiB end with a full chunk.
                let complete =
                    chunk.len() < METADATA_PIECE_SIZE || self.buffer.len() >= self.total_size;
                if !complete {
                    self.request_piece(session, self.current_piece).await?;
                    return Ok(None);
                }

                self.finish().map(Some)
            }
        }
    }

    /// Verify the reassembled dict and decode it
    fn finish(&self) -> Result<TorrentInfo> {
        let mut hasher = Sha1::new();
        hasher.update(&self.buffer);
        let hash: Sha1Hash = hasher.finalize().into();

        if hash != self.info_hash {
            return Err(EngineError::integrity(
                IntegrityErrorKind::MetadataHash,
                "metadata SHA-1 does not match the info hash",
            ));
        }

        TorrentInfo::from_bytes(&self.buffer)
    }
}

fn metadata_error(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::MetadataError, message)
}
