//! Magnet URI parser
//!
//! Parses `magnet:?xt=urn:btih:<HEX40>&dn=<name>&tr=<udp-url>&...` into the
//! 20-byte info hash, a display name, and the list of UDP tracker endpoints.
//! Tracker URLs are reduced to `host:port`: the scheme is stripped and any
//! path (`/announce`) dropped, because UDP trackers do not use paths.
//! Non-UDP trackers are skipped.

use std::fmt;

use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::torrent::metainfo::Sha1Hash;

/// A UDP tracker endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackerEndpoint {
    /// Hostname or IP address
    pub host: String,
    /// UDP port
    pub port: u16,
}

impl fmt::Display for TrackerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parsed magnet link
#[derive(Debug, Clone)]
pub struct MagnetLink {
    /// Info hash (20 bytes)
    pub info_hash: Sha1Hash,
    /// Display name
    pub display_name: String,
    /// UDP tracker endpoints, deduplicated, in URI order
    pub trackers: Vec<TrackerEndpoint>,
}

impl MagnetLink {
    /// Parse a magnet URI string
    pub fn parse(uri: &str) -> Result<Self> {
        let query = uri.strip_prefix("magnet:?").ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::InvalidMagnet,
                "URI must start with 'magnet:?'",
            )
        })?;

        let mut info_hash: Option<Sha1Hash> = None;
        let mut display_name: Option<String> = None;
        let mut trackers: Vec<TrackerEndpoint> = Vec::new();

        for param in query.split('&') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = url_decode(value);

            match key {
                "xt" => {
                    info_hash = parse_btih(&value);
                }
                "dn" => {
                    display_name = Some(value);
                }
                "tr" => match parse_udp_endpoint(&value) {
                    Some(endpoint) => {
                        if !trackers.contains(&endpoint) {
                            trackers.push(endpoint);
                        }
                    }
                    None => {
                        tracing::warn!(tracker = %value, "skipping unsupported tracker URL");
                    }
                },
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::InvalidMagnet,
                "missing or invalid 'xt' parameter (info hash)",
            )
        })?;

        let display_name = display_name.unwrap_or_else(|| hex_string(&info_hash));

        Ok(Self {
            info_hash,
            display_name,
            trackers,
        })
    }

    /// Info hash as lowercase hex
    pub fn info_hash_hex(&self) -> String {
        hex_string(&self.info_hash)
    }
}

/// Parse an `xt=urn:btih:<HEX40>` value into an info hash
fn parse_btih(xt: &str) -> Option<Sha1Hash> {
    let digits = xt.strip_prefix("urn:btih:")?;
    if digits.len() != 40 {
        return None;
    }

    let mut hash = [0u8; 20];
    for (i, byte) in hash.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(hash)
}

/// Reduce a `udp://host:port[/path]` tracker URL to `host:port`
fn parse_udp_endpoint(url: &str) -> Option<TrackerEndpoint> {
    let rest = url.strip_prefix("udp://")?;
    let host_port = rest.split('/').next().unwrap_or(rest);
    let (host, port) = host_port.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;

    if host.is_empty() || port == 0 {
        return None;
    }

    Some(TrackerEndpoint {
        host: host.to_string(),
        port,
    })
}

fn hex_string(hash: &Sha1Hash) -> String {
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Percent-decode a query parameter value ('+' decodes to a space)
fn url_decode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let raw = s.as_bytes();
    let mut i = 0;

    while i < raw.len() {
        match raw[i] {
            b'%' => {
                let hex = raw.get(i + 1..i + 3).and_then(|h| {
                    std::str::from_utf8(h)
                        .ok()
                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                });
                match hex {
                    Some(byte) => {
                        bytes.push(byte);
                        i += 3;
                    }
                    None => {
                        bytes.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                bytes.push(b' ');
                i += 1;
            }
            b => {
                bytes.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&bytes).into_owned()
}
