//! BitTorrent protocol stack
//!
//! Everything needed to turn a magnet link into a file on disk:
//! - Magnet URI parsing
//! - UDP tracker communication (BEP 15)
//! - Peer wire protocol (BEP 3) with extension messaging (BEP 10)
//! - Metadata exchange (BEP 9)
//! - Piece-parallel download with SHA-1 verification

pub mod bencode;
pub mod download;
pub mod magnet;
pub mod metadata;
pub mod metainfo;
pub mod peer;
pub mod tracker;
pub mod wire;

pub use bencode::BencodeValue;
pub use download::{DownloadProgress, Downloader, PieceResult, PieceWork, MAX_BLOCK};
pub use magnet::{MagnetLink, TrackerEndpoint};
pub use metadata::{
    MetadataFetcher, MetadataMessage, MetadataMessageType, METADATA_EXTENSION_NAME,
    METADATA_PIECE_SIZE, OUR_METADATA_ID,
};
pub use metainfo::{FileEntry, Sha1Hash, TargetFile, TorrentInfo};
pub use peer::PeerSession;
pub use tracker::{
    generate_peer_id, AnnounceHeader, AnnounceRequest, AnnounceResponse, ConnectRequest,
    ConnectResponse, PeerAddr, TrackerClient,
};
pub use wire::{Handshake, PeerMessage, HANDSHAKE_LEN, MAX_PAYLOAD_LEN};
