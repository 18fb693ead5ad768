//! # magnet-dl
//!
//! A minimal BitTorrent client that, given only a magnet link, downloads
//! the largest file inside the referenced torrent to the local filesystem.
//!
//! The client obtains peers from the magnet's UDP trackers (BEP 15), learns
//! the torrent's info dictionary from a peer over the extension protocol
//! (BEP 10 / BEP 9), then fetches and SHA-1-verifies every piece of the
//! target file from the swarm in parallel.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use magnet_dl::{ClientConfig, MagnetClient, MagnetLink};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let magnet = MagnetLink::parse("magnet:?xt=urn:btih:...")?;
//!     let client = MagnetClient::new(ClientConfig::default())?;
//!     let path = client.download(&magnet).await?;
//!     println!("saved to {}", path.display());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod torrent;

// Re-exports for convenience
pub use config::ClientConfig;
pub use engine::MagnetClient;
pub use error::{
    EngineError, IntegrityErrorKind, NetworkErrorKind, ProtocolErrorKind, Result,
};
pub use torrent::{MagnetLink, PeerAddr, TorrentInfo, TrackerEndpoint};
