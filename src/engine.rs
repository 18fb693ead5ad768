//! Top-level orchestration
//!
//! Runs the three phases of a magnet download in order: announce to the
//! trackers for a swarm, fetch the info dict from a peer, then download and
//! verify every piece of the largest file.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ClientConfig;
use crate::error::{EngineError, Result};
use crate::torrent::download::Downloader;
use crate::torrent::magnet::MagnetLink;
use crate::torrent::metadata::MetadataFetcher;
use crate::torrent::metainfo::TorrentInfo;
use crate::torrent::peer::PeerSession;
use crate::torrent::tracker::{generate_peer_id, PeerAddr, TrackerClient};

/// A magnet download session
pub struct MagnetClient {
    config: ClientConfig,
    peer_id: [u8; 20],
}

impl MagnetClient {
    /// Create a client with a fresh session peer id
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            peer_id: generate_peer_id(),
        })
    }

    /// Download the largest file of the magnet's torrent.
    ///
    /// Returns the path of the written file.
    pub async fn download(&self, magnet: &MagnetLink) -> Result<PathBuf> {
        tracing::info!(name = %magnet.display_name, "starting download");

        tracing::info!(trackers = magnet.trackers.len(), "requesting peers");
        let tracker = TrackerClient::new(self.peer_id, &self.config);
        let peers = tracker
            .announce_all(&magnet.trackers, magnet.info_hash)
            .await?;
        tracing::info!(peers = peers.len(), "received swarm");

        tracing::info!("fetching metadata");
        let info = Arc::new(self.fetch_metadata(magnet, &peers).await?);
        let target = info.target()?;
        tracing::info!(
            file = target.file_name(),
            size = target.size,
            pieces = target.num_pieces(),
            "metadata complete"
        );

        let downloader = Downloader::new(
            magnet.info_hash,
            self.peer_id,
            info,
            target,
            self.config.clone(),
        );
        let path = downloader.run(&peers).await?;
        tracing::info!(path = %path.display(), "download complete");

        Ok(path)
    }

    /// Try peers in order until one serves a verified info dict
    async fn fetch_metadata(
        &self,
        magnet: &MagnetLink,
        peers: &[PeerAddr],
    ) -> Result<TorrentInfo> {
        for peer in peers {
            match self.fetch_metadata_from(magnet, *peer).await {
                Ok(info) => return Ok(info),
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "metadata fetch failed");
                }
            }
        }
        Err(EngineError::NoMetadata)
    }

    async fn fetch_metadata_from(
        &self,
        magnet: &MagnetLink,
        peer: PeerAddr,
    ) -> Result<TorrentInfo> {
        let mut session = PeerSession::connect(
            peer.socket_addr(),
            magnet.info_hash,
            self.peer_id,
            self.config.metadata_dial_timeout(),
            self.config.peer_read_timeout(),
        )
        .await?;

        // Declare interest but do not wait for an unchoke: the metadata
        // exchange is independent of choke state, and the extended
        // handshake usually arrives before any unchoke would.
        session.send(crate::torrent::wire::PeerMessage::Interested).await?;

        MetadataFetcher::new(magnet.info_hash)
            .fetch(&mut session)
            .await
    }

    /// The session's peer id
    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }
}
