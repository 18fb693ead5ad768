//! Typed error hierarchy for magnet-dl
//!
//! Errors are recovered at the peer or tracker boundary and only surfaced
//! once the supply of candidates is exhausted. Every recoverable error kind
//! carries enough context to decide whether retrying makes sense.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the client
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-related errors (connection, timeout, DNS, etc.)
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        retryable: bool,
    },

    /// Disk errors while writing the output file
    #[error("Storage error at {path:?}: {message}")]
    Storage { path: PathBuf, message: String },

    /// Protocol-level errors (tracker wire format, peer wire format, bencode)
    #[error("Protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// SHA-1 verification failures
    #[error("Integrity error: {message}")]
    Integrity {
        kind: IntegrityErrorKind,
        message: String,
    },

    /// Invalid input from the user (malformed magnet URI, bad config)
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// No tracker returned any peers
    #[error("No tracker returned any peers")]
    NoPeers,

    /// No peer delivered a valid info dictionary
    #[error("No peer delivered usable torrent metadata")]
    NoMetadata,

    /// Work queue drained with pieces missing and no workers left
    #[error("Download stalled: {verified} of {expected} pieces verified, no live peers")]
    DownloadStalled { verified: usize, expected: usize },
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// DNS resolution failed
    DnsResolution,
    /// Connection refused
    ConnectionRefused,
    /// Connection reset
    ConnectionReset,
    /// Read or connect deadline expired
    Timeout,
    /// Other network error
    Other,
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Invalid magnet URI
    InvalidMagnet,
    /// Malformed tracker reply (size, action, transaction id)
    TrackerError,
    /// Peer wire protocol violation (framing, handshake, block offsets)
    PeerProtocol,
    /// Bencode parsing error
    BencodeParse,
    /// Info dictionary missing required fields
    InvalidInfo,
    /// Metadata exchange failure (BEP 9)
    MetadataError,
}

/// Integrity error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityErrorKind {
    /// Piece SHA-1 does not match the hash from the info dict
    PieceHash,
    /// Reassembled metadata SHA-1 does not match the info hash
    MetadataHash,
}

impl EngineError {
    /// Check if this error is worth retrying against the same endpoint
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Integrity { kind, .. } => matches!(kind, IntegrityErrorKind::PieceHash),
            _ => false,
        }
    }

    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            NetworkErrorKind::Timeout | NetworkErrorKind::ConnectionReset
        );
        Self::Network {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a storage error
    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Create an integrity error
    pub fn integrity(kind: IntegrityErrorKind, message: impl Into<String>) -> Self {
        Self::Integrity {
            kind,
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_retryable() {
        let err = EngineError::network(NetworkErrorKind::Timeout, "read deadline expired");
        assert!(err.is_retryable());

        let err = EngineError::network(NetworkErrorKind::DnsResolution, "no such host");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_piece_hash_is_retryable() {
        let err = EngineError::integrity(IntegrityErrorKind::PieceHash, "piece 7 mismatch");
        assert!(err.is_retryable());

        let err = EngineError::integrity(IntegrityErrorKind::MetadataHash, "info dict mismatch");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_terminal_errors_are_not_retryable() {
        assert!(!EngineError::NoPeers.is_retryable());
        assert!(!EngineError::NoMetadata.is_retryable());
        assert!(!EngineError::DownloadStalled {
            verified: 3,
            expected: 10
        }
        .is_retryable());
    }
}
