//! Peer session
//!
//! One TCP connection's lifecycle: dial, handshake, framed message loop.
//! All work within a session is sequential, so connection state lives in
//! plain fields with no locking. The session updates choke/interest flags
//! and the remote bitfield as messages arrive; higher layers (metadata
//! fetch, piece download) drive the loop and consume the messages they
//! care about.

use std::net::SocketAddr;
use std::time::Duration;

use bitvec::prelude::*;
use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result};
use crate::torrent::metainfo::Sha1Hash;
use crate::torrent::wire::{self, Handshake, PeerMessage, HANDSHAKE_LEN};

/// Initial read capacity; grows to fit the largest frame seen
const READ_BUFFER_CAPACITY: usize = 32 * 1024;

/// An established peer connection
pub struct PeerSession {
    stream: TcpStream,
    addr: SocketAddr,
    remote_id: [u8; 20],
    remote_extensions: bool,
    read_timeout: Duration,
    read_buf: BytesMut,

    // Choke/interest state, one pair in each direction.
    // Initial state per BEP 3: both sides choking, neither interested.
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,

    /// One bit per torrent piece; bit i set means the peer claims piece i.
    /// Bit 0 is the MSB of byte 0.
    bitfield: BitVec<u8, Msb0>,
}

impl PeerSession {
    /// Dial a peer and exchange handshakes.
    ///
    /// Closes the connection (by dropping it) on any validation failure:
    /// wrong protocol string or an info hash that does not match ours.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        peer_id: [u8; 20],
        dial_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        let stream = timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| EngineError::network(NetworkErrorKind::Timeout, "peer dial timeout"))?
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::ConnectionRefused,
                    format!("failed to connect to {}: {}", addr, e),
                )
            })?;

        let mut session = Self {
            stream,
            addr,
            remote_id: [0u8; 20],
            remote_extensions: false,
            read_timeout,
            read_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: BitVec::new(),
        };

        session.handshake(info_hash, peer_id).await?;
        Ok(session)
    }

    async fn handshake(&mut self, info_hash: Sha1Hash, peer_id: [u8; 20]) -> Result<()> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let ours = Handshake::new(info_hash, peer_id);
        timeout(self.read_timeout, self.stream.write_all(&ours.encode()))
            .await
            .map_err(|_| {
                EngineError::network(NetworkErrorKind::Timeout, "handshake send timeout")
            })?
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("handshake send failed: {}", e),
                )
            })?;

        let mut reply = [0u8; HANDSHAKE_LEN];
        timeout(self.read_timeout, self.stream.read_exact(&mut reply))
            .await
            .map_err(|_| {
                EngineError::network(NetworkErrorKind::Timeout, "handshake receive timeout")
            })?
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("handshake receive failed: {}", e),
                )
            })?;

        let theirs = Handshake::decode(&reply)?;
        if theirs.info_hash != info_hash {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                "handshake info hash mismatch",
            ));
        }

        self.remote_id = theirs.peer_id;
        self.remote_extensions = theirs.supports_extensions();
        Ok(())
    }

    /// Send one message
    pub async fn send(&mut self, msg: PeerMessage) -> Result<()> {
        match msg {
            PeerMessage::Interested => self.am_interested = true,
            PeerMessage::NotInterested => self.am_interested = false,
            PeerMessage::Choke => self.am_choking = true,
            PeerMessage::Unchoke => self.am_choking = false,
            _ => {}
        }
        wire::write_message(&mut self.stream, &msg).await
    }

    /// Receive one message, applying its state effects first.
    ///
    /// Blocks for at most the configured read deadline; expiry surfaces as
    /// a retryable timeout error.
    pub async fn recv(&mut self) -> Result<PeerMessage> {
        let msg = wire::read_message(&mut self.stream, &mut self.read_buf, self.read_timeout)
            .await?;
        self.apply(&msg);
        Ok(msg)
    }

    fn apply(&mut self, msg: &PeerMessage) {
        match msg {
            PeerMessage::Choke => self.peer_choking = true,
            PeerMessage::Unchoke => self.peer_choking = false,
            PeerMessage::Interested => self.peer_interested = true,
            PeerMessage::NotInterested => self.peer_interested = false,
            PeerMessage::Have { index } => {
                let index = *index as usize;
                if index >= self.bitfield.len() {
                    self.bitfield.resize(index + 1, false);
                }
                self.bitfield.set(index, true);
            }
            PeerMessage::Bitfield { bits } => {
                self.bitfield = BitVec::from_slice(bits);
            }
            _ => {}
        }
    }

    /// Declare interest and pump the message loop until the peer unchokes
    /// us. Bitfield and have messages arriving meanwhile are absorbed.
    pub async fn express_interest(&mut self) -> Result<()> {
        self.send(PeerMessage::Interested).await?;
        while self.peer_choking {
            self.recv().await?;
        }
        Ok(())
    }

    /// Whether the peer claims to have piece `index`
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield
            .get(index as usize)
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    /// Whether the peer advertised extension-protocol support (BEP 10)
    pub fn supports_extensions(&self) -> bool {
        self.remote_extensions
    }

    /// Whether the peer is currently choking us
    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    /// Whether the peer declared interest in us
    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    /// Whether we are choking the peer
    pub fn am_choking(&self) -> bool {
        self.am_choking
    }

    /// Whether we declared interest in the peer
    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    /// Remote peer id from the handshake
    pub fn remote_id(&self) -> &[u8; 20] {
        &self.remote_id
    }

    /// Remote socket address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("addr", &self.addr)
            .field("am_interested", &self.am_interested)
            .field("peer_choking", &self.peer_choking)
            .field("pieces", &self.bitfield.count_ones())
            .finish()
    }
}
