//! UDP tracker client (BEP 15)
//!
//! A session against one tracker is two binary request/response exchanges
//! over the same socket: connect (obtain a connection id) then announce
//! (obtain the peer list). Each exchange retries independently with the
//! BEP 15 back-off, timeout `base * 2^n` for attempt `n`. All integers are
//! big-endian.
//!
//! Trackers are contacted concurrently; the first non-empty peer list wins.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::config::ClientConfig;
use crate::error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result};
use crate::torrent::magnet::TrackerEndpoint;
use crate::torrent::metainfo::Sha1Hash;

/// Magic constant opening every connect request
pub const PROTOCOL_MAGIC: i64 = 0x0417_2710_1980;

/// Actions
pub const ACTION_CONNECT: i32 = 0;
pub const ACTION_ANNOUNCE: i32 = 1;
pub const ACTION_ERROR: i32 = 3;

/// Sizes of the fixed-layout records
pub const CONNECT_REQUEST_LEN: usize = 16;
pub const CONNECT_RESPONSE_LEN: usize = 16;
pub const ANNOUNCE_REQUEST_LEN: usize = 98;
pub const ANNOUNCE_HEADER_LEN: usize = 20;

/// Bytes per compact peer record: 4-byte IPv4 + 2-byte port
const PEER_RECORD_LEN: usize = 6;

/// Largest reply we accept: header plus ~680 peer records
const RECV_BUFFER_LEN: usize = 4096;

/// `left` value reported while the torrent size is still unknown
/// (the magnet phase announces before any metadata exists)
const LEFT_UNKNOWN: i64 = 2_000_000_000;

/// Connect request: `{magic, action=0, transaction_id}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub transaction_id: i32,
}

impl ConnectRequest {
    pub fn encode(&self) -> [u8; CONNECT_REQUEST_LEN] {
        let mut buf = [0u8; CONNECT_REQUEST_LEN];
        buf[0..8].copy_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
        buf[12..16].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < CONNECT_REQUEST_LEN {
            return Err(tracker_error("connect request too short"));
        }
        if read_i64(data, 0) != PROTOCOL_MAGIC {
            return Err(tracker_error("connect request missing protocol magic"));
        }
        if read_i32(data, 8) != ACTION_CONNECT {
            return Err(tracker_error("connect request has wrong action"));
        }
        Ok(Self {
            transaction_id: read_i32(data, 12),
        })
    }
}

/// Connect response: `{action=0, transaction_id, connection_id}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub transaction_id: i32,
    pub connection_id: i64,
}

impl ConnectResponse {
    pub fn encode(&self) -> [u8; CONNECT_RESPONSE_LEN] {
        let mut buf = [0u8; CONNECT_RESPONSE_LEN];
        buf[0..4].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
        buf[4..8].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf[8..16].copy_from_slice(&self.connection_id.to_be_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < CONNECT_RESPONSE_LEN {
            return Err(tracker_error("connect response too short"));
        }
        let action = read_i32(data, 0);
        if action != ACTION_CONNECT {
            return Err(tracker_error(format!(
                "connect response has action {}",
                action
            )));
        }
        Ok(Self {
            transaction_id: read_i32(data, 4),
            connection_id: read_i64(data, 8),
        })
    }
}

/// Announce request, 98 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub connection_id: i64,
    pub transaction_id: i32,
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
    pub downloaded: i64,
    pub left: i64,
    pub uploaded: i64,
    pub event: i32,
    pub ip: u32,
    pub key: u32,
    pub num_want: i32,
    pub port: u16,
}

impl AnnounceRequest {
    pub fn encode(&self) -> [u8; ANNOUNCE_REQUEST_LEN] {
        let mut buf = [0u8; ANNOUNCE_REQUEST_LEN];
        buf[0..8].copy_from_slice(&self.connection_id.to_be_bytes());
        buf[8..12].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        buf[12..16].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf[16..36].copy_from_slice(&self.info_hash);
        buf[36..56].copy_from_slice(&self.peer_id);
        buf[56..64].copy_from_slice(&self.downloaded.to_be_bytes());
        buf[64..72].copy_from_slice(&self.left.to_be_bytes());
        buf[72..80].copy_from_slice(&self.uploaded.to_be_bytes());
        buf[80..84].copy_from_slice(&self.event.to_be_bytes());
        buf[84..88].copy_from_slice(&self.ip.to_be_bytes());
        buf[88..92].copy_from_slice(&self.key.to_be_bytes());
        buf[92..96].copy_from_slice(&self.num_want.to_be_bytes());
        buf[96..98].copy_from_slice(&self.port.to_be_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < ANNOUNCE_REQUEST_LEN {
            return Err(tracker_error("announce request too short"));
        }
        if read_i32(data, 8) != ACTION_ANNOUNCE {
            return Err(tracker_error("announce request has wrong action"));
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[16..36]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[36..56]);

        Ok(Self {
            connection_id: read_i64(data, 0),
            transaction_id: read_i32(data, 12),
            info_hash,
            peer_id,
            downloaded: read_i64(data, 56),
            left: read_i64(data, 64),
            uploaded: read_i64(data, 72),
            event: read_i32(data, 80),
            ip: read_u32(data, 84),
            key: read_u32(data, 88),
            num_want: read_i32(data, 92),
            port: u16::from_be_bytes([data[96], data[97]]),
        })
    }
}

/// Announce response header: `{action=1, transaction_id, interval, leechers, seeders}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceHeader {
    pub transaction_id: i32,
    pub interval: i32,
    pub leechers: i32,
    pub seeders: i32,
}

impl AnnounceHeader {
    pub fn encode(&self) -> [u8; ANNOUNCE_HEADER_LEN] {
        let mut buf = [0u8; ANNOUNCE_HEADER_LEN];
        buf[0..4].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        buf[4..8].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.interval.to_be_bytes());
        buf[12..16].copy_from_slice(&self.leechers.to_be_bytes());
        buf[16..20].copy_from_slice(&self.seeders.to_be_bytes());
        buf
    }
}

/// Full announce response: header plus compact peer records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub header: AnnounceHeader,
    pub peers: Vec<PeerAddr>,
}

impl AnnounceResponse {
    /// Parse a reply datagram.
    ///
    /// `action=3` replies carry an error string and surface as a tracker
    /// error. Trailing bytes shorter than one peer record are discarded.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(tracker_error("announce response too short"));
        }

        let action = read_i32(data, 0);
        if action == ACTION_ERROR {
            let text = String::from_utf8_lossy(&data[8..]);
            return Err(tracker_error(format!("tracker error: {}", text)));
        }
        if action != ACTION_ANNOUNCE {
            return Err(tracker_error(format!(
                "announce response has action {}",
                action
            )));
        }
        if data.len() < ANNOUNCE_HEADER_LEN {
            return Err(tracker_error("announce response header truncated"));
        }

        let header = AnnounceHeader {
            transaction_id: read_i32(data, 4),
            interval: read_i32(data, 8),
            leechers: read_i32(data, 12),
            seeders: read_i32(data, 16),
        };

        let peers = data[ANNOUNCE_HEADER_LEN..]
            .chunks_exact(PEER_RECORD_LEN)
            .map(|record| PeerAddr {
                ip: Ipv4Addr::new(record[0], record[1], record[2], record[3]),
                port: u16::from_be_bytes([record[4], record[5]]),
            })
            .collect();

        Ok(Self { header, peers })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ANNOUNCE_HEADER_LEN + self.peers.len() * PEER_RECORD_LEN);
        buf.extend_from_slice(&self.header.encode());
        for peer in &self.peers {
            buf.extend_from_slice(&peer.ip.octets());
            buf.extend_from_slice(&peer.port.to_be_bytes());
        }
        buf
    }
}

/// A swarm member as reported by a tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerAddr {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

fn read_i32(data: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    read_i32(data, offset) as u32
}

fn read_i64(data: &[u8], offset: usize) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    i64::from_be_bytes(buf)
}

fn tracker_error(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::TrackerError, message)
}

/// Client for announcing against UDP trackers
#[derive(Debug, Clone)]
pub struct TrackerClient {
    peer_id: [u8; 20],
    client_port: u16,
    attempts: u32,
    backoff_base: Duration,
    fanout_deadline: Duration,
}

impl TrackerClient {
    pub fn new(peer_id: [u8; 20], config: &ClientConfig) -> Self {
        Self {
            peer_id,
            client_port: config.client_port,
            attempts: config.tracker_attempts,
            backoff_base: config.tracker_backoff_base(),
            fanout_deadline: config.tracker_fanout_deadline(),
        }
    }

    /// Announce to every tracker concurrently and return the first
    /// non-empty peer list. Fails with `NoPeers` when every tracker fails
    /// or answers with an empty swarm.
    pub async fn announce_all(
        &self,
        trackers: &[TrackerEndpoint],
        info_hash: Sha1Hash,
    ) -> Result<Vec<PeerAddr>> {
        if trackers.is_empty() {
            return Err(EngineError::NoPeers);
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<PeerAddr>>(trackers.len());
        let mut tasks = tokio::task::JoinSet::new();

        for endpoint in trackers {
            let client = self.clone();
            let endpoint = endpoint.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                match client.announce(&endpoint, info_hash).await {
                    Ok(peers) if !peers.is_empty() => {
                        let _ = tx.send(peers).await;
                    }
                    Ok(_) => {
                        tracing::debug!(tracker = %endpoint, "tracker returned an empty swarm");
                    }
                    Err(e) => {
                        tracing::debug!(tracker = %endpoint, error = %e, "tracker announce failed");
                    }
                }
            });
        }
        drop(tx);

        let peers = timeout(self.fanout_deadline, rx.recv())
            .await
            .ok()
            .flatten()
            .ok_or(EngineError::NoPeers)?;

        tasks.abort_all();
        Ok(peers)
    }

    /// Run the connect + announce exchange against a single tracker
    pub async fn announce(
        &self,
        endpoint: &TrackerEndpoint,
        info_hash: Sha1Hash,
    ) -> Result<Vec<PeerAddr>> {
        let addr = resolve(endpoint).await?;

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| {
            EngineError::network(
                NetworkErrorKind::Other,
                format!("failed to bind UDP socket: {}", e),
            )
        })?;
        socket.connect(addr).await.map_err(|e| {
            EngineError::network(
                NetworkErrorKind::ConnectionRefused,
                format!("failed to connect socket: {}", e),
            )
        })?;

        let connection = self.connect_phase(&socket).await?;
        let response = self.announce_phase(&socket, connection, info_hash).await?;

        tracing::info!(
            tracker = %endpoint,
            seeders = response.header.seeders,
            leechers = response.header.leechers,
            peers = response.peers.len(),
            "announce succeeded"
        );

        Ok(response.peers)
    }

    async fn connect_phase(&self, socket: &UdpSocket) -> Result<ConnectResponse> {
        let transaction_id: i32 = rand::rng().random();
        let request = ConnectRequest { transaction_id };

        let reply = self.exchange(socket, &request.encode()).await?;
        let response = ConnectResponse::parse(&reply)?;

        if response.transaction_id != transaction_id {
            return Err(tracker_error("connect transaction id mismatch"));
        }

        Ok(response)
    }

    async fn announce_phase(
        &self,
        socket: &UdpSocket,
        connection: ConnectResponse,
        info_hash: Sha1Hash,
    ) -> Result<AnnounceResponse> {
        let transaction_id: i32 = rand::rng().random();
        let request = AnnounceRequest {
            connection_id: connection.connection_id,
            transaction_id,
            info_hash,
            peer_id: self.peer_id,
            downloaded: 0,
            left: LEFT_UNKNOWN,
            uploaded: 0,
            event: 0,
            ip: 0,
            key: rand::rng().random(),
            num_want: -1,
            port: self.client_port,
        };

        let reply = self.exchange(socket, &request.encode()).await?;
        let response = AnnounceResponse::parse(&reply)?;

        if response.header.transaction_id != transaction_id {
            return Err(tracker_error("announce transaction id mismatch"));
        }

        Ok(response)
    }

    /// Send a request and wait for the reply, retrying with the BEP 15
    /// back-off. Only timeouts are retried; any other socket error aborts
    /// this tracker.
    async fn exchange(&self, socket: &UdpSocket, request: &[u8]) -> Result<Vec<u8>> {
        let mut reply = [0u8; RECV_BUFFER_LEN];

        for attempt in 0..self.attempts {
            socket.send(request).await.map_err(|e| {
                EngineError::network(NetworkErrorKind::Other, format!("UDP send failed: {}", e))
            })?;

            let deadline = self.backoff_base * 2u32.pow(attempt);
            match timeout(deadline, socket.recv(&mut reply)).await {
                Ok(Ok(len)) => return Ok(reply[..len].to_vec()),
                Ok(Err(e)) => {
                    return Err(EngineError::network(
                        NetworkErrorKind::Other,
                        format!("UDP recv failed: {}", e),
                    ))
                }
                Err(_) => {
                    tracing::debug!(attempt, "tracker request timed out, backing off");
                }
            }
        }

        Err(EngineError::network(
            NetworkErrorKind::Timeout,
            format!("tracker unresponsive after {} attempts", self.attempts),
        ))
    }
}

async fn resolve(endpoint: &TrackerEndpoint) -> Result<SocketAddr> {
    let addrs = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| {
            EngineError::network(
                NetworkErrorKind::DnsResolution,
                format!("failed to resolve {}: {}", endpoint, e),
            )
        })?;

    // IPv6 trackers are out of scope; take the first v4 address
    addrs
        .into_iter()
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| {
            EngineError::network(
                NetworkErrorKind::DnsResolution,
                format!("no IPv4 address for {}", endpoint),
            )
        })
}

/// Generate a session peer id in Azureus style: `-MD0001-` + 12 random bytes
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(b"-MD0001-");
    rand::rng().fill(&mut peer_id[8..]);
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_roundtrip() {
        let request = ConnectRequest {
            transaction_id: 0x1234_5678,
        };
        let encoded = request.encode();
        assert_eq!(encoded.len(), CONNECT_REQUEST_LEN);
        assert_eq!(&encoded[0..8], &PROTOCOL_MAGIC.to_be_bytes());
        assert_eq!(ConnectRequest::parse(&encoded).unwrap(), request);
    }

    #[test]
    fn test_connect_response_roundtrip() {
        let response = ConnectResponse {
            transaction_id: -7,
            connection_id: 0x0102_0304_0506_0708,
        };
        let encoded = response.encode();
        assert_eq!(ConnectResponse::parse(&encoded).unwrap(), response);
    }

    #[test]
    fn test_announce_request_roundtrip() {
        let request = AnnounceRequest {
            connection_id: 99,
            transaction_id: 42,
            info_hash: [0xAA; 20],
            peer_id: *b"-MD0001-000000000000",
            downloaded: 0,
            left: LEFT_UNKNOWN,
            uploaded: 0,
            event: 0,
            ip: 0,
            key: 0xDEAD_BEEF,
            num_want: -1,
            port: 6888,
        };
        let encoded = request.encode();
        assert_eq!(encoded.len(), ANNOUNCE_REQUEST_LEN);
        assert_eq!(AnnounceRequest::parse(&encoded).unwrap(), request);
    }

    #[test]
    fn test_announce_response_roundtrip() {
        let response = AnnounceResponse {
            header: AnnounceHeader {
                transaction_id: 11,
                interval: 1800,
                leechers: 3,
                seeders: 12,
            },
            peers: vec![
                PeerAddr {
                    ip: Ipv4Addr::new(127, 0, 0, 1),
                    port: 6881,
                },
                PeerAddr {
                    ip: Ipv4Addr::new(10, 0, 0, 2),
                    port: 51413,
                },
            ],
        };
        let encoded = response.encode();
        assert_eq!(AnnounceResponse::parse(&encoded).unwrap(), response);
    }

    #[test]
    fn test_announce_response_discards_trailing_bytes() {
        let response = AnnounceResponse {
            header: AnnounceHeader {
                transaction_id: 1,
                interval: 60,
                leechers: 0,
                seeders: 1,
            },
            peers: vec![PeerAddr {
                ip: Ipv4Addr::new(192, 168, 1, 1),
                port: 6881,
            }],
        };
        let mut encoded = response.encode();
        encoded.extend_from_slice(&[1, 2, 3]); // less than one peer record

        let parsed = AnnounceResponse::parse(&encoded).unwrap();
        assert_eq!(parsed.peers.len(), 1);
    }

    #[test]
    fn test_announce_error_response() {
        let mut data = Vec::new();
        data.extend_from_slice(&ACTION_ERROR.to_be_bytes());
        data.extend_from_slice(&42i32.to_be_bytes());
        data.extend_from_slice(b"torrent not registered");

        let err = AnnounceResponse::parse(&data).unwrap_err();
        assert!(err.to_string().contains("torrent not registered"));
    }

    #[test]
    fn test_announce_zero_peers() {
        let response = AnnounceResponse {
            header: AnnounceHeader {
                transaction_id: 5,
                interval: 1800,
                leechers: 0,
                seeders: 0,
            },
            peers: Vec::new(),
        };
        let encoded = response.encode();
        assert_eq!(encoded.len(), ANNOUNCE_HEADER_LEN);
        assert!(AnnounceResponse::parse(&encoded).unwrap().peers.is_empty());
    }

    #[test]
    fn test_connect_response_wrong_action_rejected() {
        let response = ConnectResponse {
            transaction_id: 1,
            connection_id: 2,
        };
        let mut encoded = response.encode();
        encoded[3] = 1; // action = announce
        assert!(ConnectResponse::parse(&encoded).is_err());
    }

    #[test]
    fn test_generate_peer_id() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[..8], b"-MD0001-");
        assert_ne!(generate_peer_id()[8..], peer_id[8..]);
    }
}
