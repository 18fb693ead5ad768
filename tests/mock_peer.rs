//! Mock BitTorrent peer
//!
//! A scriptable peer for exercising the client without a real swarm. It
//! answers the handshake, sends a bitfield and (optionally) an extended
//! handshake, serves block requests from configured piece data, and speaks
//! enough ut_metadata to hand out an info dict. Behaviors the tests need
//! to observe (dropped requests, corrupted pieces, rejected metadata) are
//! toggled through the config, and everything the mock sees is recorded in
//! shared stats.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::{TcpListener, TcpStream};

use magnet_dl::torrent::metadata::{
    MetadataMessage, MetadataMessageType, METADATA_PIECE_SIZE, OUR_METADATA_ID,
};
use magnet_dl::torrent::wire::{self, Handshake, PeerMessage, HANDSHAKE_LEN};

/// The ut_metadata id the mock advertises for itself
pub const MOCK_METADATA_ID: u8 = 1;

/// Mock peer behavior
#[derive(Clone)]
pub struct MockPeerConfig {
    pub info_hash: [u8; 20],
    /// Bitfield bytes sent after the handshake (MSB-first)
    pub bitfield: Vec<u8>,
    /// Piece data served for block requests, by global piece index
    pub piece_data: HashMap<u32, Vec<u8>>,
    /// Unchoke right after the handshake instead of waiting for interest
    pub auto_unchoke: bool,
    /// Set the extension bit and send an extended handshake
    pub support_extensions: bool,
    /// Include ut_metadata in the extended handshake
    pub advertise_metadata: bool,
    /// Answer metadata requests with reject
    pub reject_metadata: bool,
    /// Info dict served over ut_metadata
    pub metadata: Option<Vec<u8>>,
    /// Serve a zero-filled (wrong-hash) body the first time each of these
    /// pieces is requested from offset 0
    pub corrupt_first_serve: HashSet<u32>,
}

impl MockPeerConfig {
    pub fn new(info_hash: [u8; 20], num_pieces: usize) -> Self {
        // All bits set for a full seeder
        let mut bitfield = vec![0u8; num_pieces.div_ceil(8)];
        for index in 0..num_pieces {
            bitfield[index / 8] |= 0x80 >> (index % 8);
        }

        Self {
            info_hash,
            bitfield,
            piece_data: HashMap::new(),
            auto_unchoke: true,
            support_extensions: true,
            advertise_metadata: true,
            reject_metadata: false,
            metadata: None,
            corrupt_first_serve: HashSet::new(),
        }
    }

    pub fn with_piece(mut self, index: u32, data: Vec<u8>) -> Self {
        self.piece_data.insert(index, data);
        self
    }

    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Clear the bit for one piece
    pub fn without_piece(mut self, index: u32) -> Self {
        let byte = index as usize / 8;
        if byte < self.bitfield.len() {
            self.bitfield[byte] &= !(0x80 >> (index % 8));
        }
        self.piece_data.remove(&index);
        self
    }
}

/// Everything the mock observed, for assertions
#[derive(Debug, Default)]
pub struct MockPeerStats {
    /// Every block request received as (index, begin, length)
    pub requests: Vec<(u32, u32, u32)>,
    /// ut_metadata piece indices requested
    pub metadata_requests: Vec<usize>,
    /// Times each piece was served from offset 0
    pub piece_serves: HashMap<u32, usize>,
    /// Connections accepted
    pub connections: usize,
}

impl MockPeerStats {
    /// Block requests for one piece index
    pub fn requests_for(&self, index: u32) -> usize {
        self.requests.iter().filter(|(i, _, _)| *i == index).count()
    }
}

/// A listening mock peer
pub struct MockPeer {
    pub addr: SocketAddr,
    pub stats: Arc<Mutex<MockPeerStats>>,
}

impl MockPeer {
    /// Bind a listener and start accepting connections in the background
    pub async fn start(config: MockPeerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let stats = Arc::new(Mutex::new(MockPeerStats::default()));

        let accept_stats = stats.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accept_stats.lock().unwrap().connections += 1;

                let config = config.clone();
                let stats = accept_stats.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, config, stats).await;
                });
            }
        });

        Ok(Self { addr, stats })
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    config: MockPeerConfig,
    stats: Arc<Mutex<MockPeerStats>>,
) -> std::io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Handshake
    let mut incoming = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut incoming).await?;
    let theirs = Handshake::decode(&incoming).map_err(other)?;
    if theirs.info_hash != config.info_hash {
        return Err(other("info hash mismatch"));
    }

    let mut ours = Handshake::new(config.info_hash, *b"-MK0001-mockmockmock");
    if !config.support_extensions {
        ours.reserved = [0u8; 8];
    }
    stream.write_all(&ours.encode()).await?;

    // Bitfield, then extension handshake, then the optional unchoke
    send(&mut stream, &PeerMessage::Bitfield {
        bits: config.bitfield.clone(),
    })
    .await?;

    if config.support_extensions {
        send(&mut stream, &PeerMessage::Extended {
            ext_id: 0,
            payload: extension_handshake(&config),
        })
        .await?;
    }

    if config.auto_unchoke {
        send(&mut stream, &PeerMessage::Unchoke).await?;
    }

    // Message loop
    let mut buf = BytesMut::new();
    loop {
        let msg = wire::read_message(&mut stream, &mut buf, Duration::from_secs(30))
            .await
            .map_err(other)?;

        match msg {
            PeerMessage::Interested => {
                if !config.auto_unchoke {
                    send(&mut stream, &PeerMessage::Unchoke).await?;
                }
            }

            PeerMessage::Request {
                index,
                begin,
                length,
            } => {
                stats.lock().unwrap().requests.push((index, begin, length));
                serve_block(&mut stream, &config, &stats, index, begin, length).await?;
            }

            PeerMessage::Extended { ext_id, payload } => {
                // ext_id 0 is the client's handshake reply; anything else
                // addressed to our advertised ut_metadata id is a request.
                if ext_id == MOCK_METADATA_ID {
                    serve_metadata(&mut stream, &config, &stats, &payload).await?;
                }
            }

            PeerMessage::KeepAlive | PeerMessage::NotInterested => {}
            _ => {}
        }
    }
}

fn extension_handshake(config: &MockPeerConfig) -> Vec<u8> {
    use magnet_dl::torrent::bencode::BencodeValue;
    use std::collections::BTreeMap;

    let mut m = BTreeMap::new();
    if config.advertise_metadata {
        m.insert(
            b"ut_metadata".to_vec(),
            BencodeValue::Integer(MOCK_METADATA_ID as i64),
        );
    }

    let mut root = BTreeMap::new();
    root.insert(b"m".to_vec(), BencodeValue::Dict(m));
    if let Some(ref metadata) = config.metadata {
        root.insert(
            b"metadata_size".to_vec(),
            BencodeValue::Integer(metadata.len() as i64),
        );
    }
    BencodeValue::Dict(root).encode()
}

async fn serve_block(
    stream: &mut TcpStream,
    config: &MockPeerConfig,
    stats: &Arc<Mutex<MockPeerStats>>,
    index: u32,
    begin: u32,
    length: u32,
) -> std::io::Result<()> {
    let Some(data) = config.piece_data.get(&index) else {
        return Ok(()); // requested a piece we do not have; ignore
    };

    let corrupt = {
        let mut stats = stats.lock().unwrap();
        if begin == 0 {
            let serves = stats.piece_serves.entry(index).or_insert(0);
            *serves += 1;
        }
        config.corrupt_first_serve.contains(&index)
            && stats.piece_serves.get(&index).copied().unwrap_or(0) == 1
    };

    let end = (begin + length) as usize;
    if end > data.len() {
        return Ok(());
    }

    let block = if corrupt {
        vec![0u8; length as usize]
    } else {
        data[begin as usize..end].to_vec()
    };

    send(stream, &PeerMessage::Piece {
        index,
        begin,
        block,
    })
    .await
}

async fn serve_metadata(
    stream: &mut TcpStream,
    config: &MockPeerConfig,
    stats: &Arc<Mutex<MockPeerStats>>,
    payload: &[u8],
) -> std::io::Result<()> {
    let msg = MetadataMessage::parse(payload).map_err(other)?;
    if msg.msg_type != MetadataMessageType::Request {
        return Ok(());
    }

    stats.lock().unwrap().metadata_requests.push(msg.piece);

    let reply = if config.reject_metadata {
        MetadataMessage::reject(msg.piece)
    } else {
        let Some(ref metadata) = config.metadata else {
            return send_metadata_message(stream, &MetadataMessage::reject(msg.piece)).await;
        };
        let start = msg.piece * METADATA_PIECE_SIZE;
        if start >= metadata.len() {
            MetadataMessage::reject(msg.piece)
        } else {
            let end = (start + METADATA_PIECE_SIZE).min(metadata.len());
            MetadataMessage::data(msg.piece, metadata.len(), metadata[start..end].to_vec())
        }
    };

    send_metadata_message(stream, &reply).await
}

async fn send_metadata_message(
    stream: &mut TcpStream,
    msg: &MetadataMessage,
) -> std::io::Result<()> {
    // Replies go out under the id the client advertised in its handshake
    send(stream, &PeerMessage::Extended {
        ext_id: OUR_METADATA_ID,
        payload: msg.encode(),
    })
    .await
}

async fn send(stream: &mut TcpStream, msg: &PeerMessage) -> std::io::Result<()> {
    wire::write_message(stream, msg).await.map_err(other)
}

fn other(e: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(e.to_string())
}
