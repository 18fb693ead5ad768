//! Client configuration
//!
//! All tunables for the tracker, peer, and download phases. Timeouts are
//! stored as integer milliseconds/seconds so the struct round-trips through
//! serde cleanly; accessor methods hand out [`Duration`] values.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Maximum tracker request attempts allowed by BEP 15 (timeout 15 * 2^n).
pub const MAX_TRACKER_ATTEMPTS: u32 = 8;

/// Main configuration for the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Directory the downloaded file is written to
    pub download_dir: PathBuf,

    /// Port reported to trackers in announce requests
    pub client_port: u16,

    /// Tracker request attempts per phase (connect and announce retry
    /// independently); each attempt n waits `tracker_backoff_base_ms * 2^n`
    pub tracker_attempts: u32,

    /// Base of the tracker retry back-off in milliseconds (15 s per BEP 15)
    pub tracker_backoff_base_ms: u64,

    /// Overall deadline for the parallel tracker fan-out, in seconds
    pub tracker_fanout_deadline_secs: u64,

    /// TCP dial timeout during the metadata phase, in milliseconds
    pub metadata_dial_timeout_ms: u64,

    /// TCP dial timeout during the download phase, in milliseconds
    pub download_dial_timeout_ms: u64,

    /// Per-message read deadline on peer connections, in milliseconds
    pub peer_read_timeout_ms: u64,

    /// Maximum in-flight block requests per peer
    pub max_backlog: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./movies"),
            client_port: 6888,
            tracker_attempts: 2,
            tracker_backoff_base_ms: 15_000,
            tracker_fanout_deadline_secs: 90,
            metadata_dial_timeout_ms: 3_000,
            download_dial_timeout_ms: 6_000,
            peer_read_timeout_ms: 3_000,
            max_backlog: 5,
        }
    }
}

impl ClientConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.tracker_attempts == 0 || self.tracker_attempts > MAX_TRACKER_ATTEMPTS {
            return Err(EngineError::invalid_input(
                "tracker_attempts",
                format!("must be in 1..={}", MAX_TRACKER_ATTEMPTS),
            ));
        }
        if self.tracker_backoff_base_ms == 0 {
            return Err(EngineError::invalid_input(
                "tracker_backoff_base_ms",
                "must be greater than zero",
            ));
        }
        if self.peer_read_timeout_ms == 0 {
            return Err(EngineError::invalid_input(
                "peer_read_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.max_backlog == 0 {
            return Err(EngineError::invalid_input(
                "max_backlog",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Tracker retry back-off base
    pub fn tracker_backoff_base(&self) -> Duration {
        Duration::from_millis(self.tracker_backoff_base_ms)
    }

    /// Overall tracker fan-out deadline
    pub fn tracker_fanout_deadline(&self) -> Duration {
        Duration::from_secs(self.tracker_fanout_deadline_secs)
    }

    /// Dial timeout for the metadata phase
    pub fn metadata_dial_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_dial_timeout_ms)
    }

    /// Dial timeout for the download phase
    pub fn download_dial_timeout(&self) -> Duration {
        Duration::from_millis(self.download_dial_timeout_ms)
    }

    /// Per-message read deadline on peer connections
    pub fn peer_read_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_read_timeout_ms)
    }
}
