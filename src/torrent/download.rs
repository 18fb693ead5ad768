//! Download coordinator
//!
//! Once metadata is present the coordinator spawns one worker task per
//! known peer. Workers share a bounded `work` queue of piece assignments
//! and an unbounded `done` channel of verified pieces. The queue capacity
//! equals the piece count, so a worker returning a piece it cannot serve
//! never blocks. The writer places each verified piece at its movie-
//! relative offset and cancels the remaining workers once every piece has
//! landed.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::torrent::metainfo::{Sha1Hash, TargetFile, TorrentInfo};
use crate::torrent::peer::PeerSession;
use crate::torrent::tracker::PeerAddr;
use crate::torrent::wire::PeerMessage;

/// Block size for piece requests (16 KiB)
pub const MAX_BLOCK: u32 = 16384;

/// A piece assignment flowing through the work queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    pub index: u32,
    pub hash: Sha1Hash,
    pub length: u64,
}

/// A verified piece flowing to the writer
#[derive(Debug)]
pub struct PieceResult {
    pub index: u32,
    pub data: Vec<u8>,
}

/// Snapshot of download progress; observable, not a contract
#[derive(Debug, Clone, Default)]
pub struct DownloadProgress {
    pub verified_pieces: usize,
    pub total_pieces: usize,
    pub verified_bytes: u64,
}

impl DownloadProgress {
    pub fn percentage(&self) -> f64 {
        if self.total_pieces == 0 {
            return 0.0;
        }
        self.verified_pieces as f64 * 100.0 / self.total_pieces as f64
    }
}

type WorkSender = mpsc::Sender<PieceWork>;
type SharedWorkReceiver = Arc<Mutex<mpsc::Receiver<PieceWork>>>;

/// Coordinates the piece-parallel download of the target file
pub struct Downloader {
    info_hash: Sha1Hash,
    peer_id: [u8; 20],
    info: Arc<TorrentInfo>,
    target: TargetFile,
    config: ClientConfig,
    progress: Arc<RwLock<DownloadProgress>>,
}

impl Downloader {
    pub fn new(
        info_hash: Sha1Hash,
        peer_id: [u8; 20],
        info: Arc<TorrentInfo>,
        target: TargetFile,
        config: ClientConfig,
    ) -> Self {
        Self {
            info_hash,
            peer_id,
            info,
            target,
            config,
            progress: Arc::new(RwLock::new(DownloadProgress::default())),
        }
    }

    /// Current progress snapshot
    pub fn progress(&self) -> DownloadProgress {
        self.progress.read().clone()
    }

    /// Download every piece of the target file from the swarm and write it
    /// to `<download_dir>/<file name>`. Returns the output path.
    pub async fn run(&self, peers: &[PeerAddr]) -> Result<PathBuf> {
        let work_items = self.build_work_items();
        let num_pieces = work_items.len();
        self.progress.write().total_pieces = num_pieces;

        // Capacity equal to the piece count makes requeue non-blocking:
        // at most num_pieces assignments exist at any time.
        let (work_tx, work_rx) = mpsc::channel::<PieceWork>(num_pieces);
        for item in work_items {
            work_tx
                .try_send(item)
                .map_err(|_| EngineError::protocol(
                    ProtocolErrorKind::PeerProtocol,
                    "work queue refused initial fill",
                ))?;
        }
        let work_rx: SharedWorkReceiver = Arc::new(Mutex::new(work_rx));

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<PieceResult>();
        let cancel = CancellationToken::new();

        let mut workers = tokio::task::JoinSet::new();
        for peer in peers {
            let worker = Worker {
                addr: *peer,
                info_hash: self.info_hash,
                peer_id: self.peer_id,
                max_backlog: self.config.max_backlog,
                dial_timeout: self.config.download_dial_timeout(),
                read_timeout: self.config.peer_read_timeout(),
                work_tx: work_tx.clone(),
                work_rx: work_rx.clone(),
                done_tx: done_tx.clone(),
                cancel: cancel.clone(),
            };
            workers.spawn(worker.run());
        }
        // Workers hold the only remaining senders; when the last one exits
        // the done channel closes and the writer observes the stall.
        drop(work_tx);
        drop(done_tx);

        let output_path = self.prepare_output().await?;
        let result = self.write_loop(&output_path, &mut done_rx, num_pieces).await;

        cancel.cancel();
        while workers.join_next().await.is_some() {}

        result.map(|_| output_path)
    }

    /// Pre-compute the in-order piece assignments for the target file
    fn build_work_items(&self) -> Vec<PieceWork> {
        let target = &self.target;
        (0..target.num_pieces())
            .map(|offset| {
                let index = target.start_piece + offset;
                PieceWork {
                    index,
                    hash: self.info.piece_hashes[index as usize],
                    length: target.piece_size(index),
                }
            })
            .collect()
    }

    async fn prepare_output(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.config.download_dir)
            .await
            .map_err(|e| {
                EngineError::storage(
                    &self.config.download_dir,
                    format!("failed to create download directory: {}", e),
                )
            })?;

        let path = self.config.download_dir.join(self.target.file_name());
        let file = File::create(&path).await.map_err(|e| {
            EngineError::storage(&path, format!("failed to create output file: {}", e))
        })?;
        file.set_len(self.target.size).await.map_err(|e| {
            EngineError::storage(&path, format!("failed to size output file: {}", e))
        })?;

        Ok(path)
    }

    /// Receive verified pieces and write them at movie-relative offsets.
    ///
    /// The piece at `index` covers `[index * piece_length, ...)` of the
    /// torrent's virtual stream; only the overlap with the movie window
    /// `[start_byte, end_byte)` is written, which trims the leading bytes
    /// of the first piece and anything past the movie end.
    async fn write_loop(
        &self,
        path: &PathBuf,
        done_rx: &mut mpsc::UnboundedReceiver<PieceResult>,
        num_pieces: usize,
    ) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| EngineError::storage(path, format!("failed to open output file: {}", e)))?;

        let mut received = 0usize;
        while received < num_pieces {
            let Some(piece) = done_rx.recv().await else {
                // All workers exited with pieces still missing
                return Err(EngineError::DownloadStalled {
                    verified: received,
                    expected: num_pieces,
                });
            };

            self.write_piece(&mut file, path, &piece).await?;
            received += 1;

            {
                let mut progress = self.progress.write();
                progress.verified_pieces = received;
                progress.verified_bytes += piece.data.len() as u64;
            }
            tracing::info!(
                piece = piece.index,
                "verified and written ({}/{} pieces)",
                received,
                num_pieces
            );
        }

        file.flush().await.map_err(|e| {
            EngineError::storage(path, format!("failed to flush output file: {}", e))
        })?;
        Ok(())
    }

    async fn write_piece(&self, file: &mut File, path: &PathBuf, piece: &PieceResult) -> Result<()> {
        let target = &self.target;
        let piece_start = u64::from(piece.index) * target.piece_length;
        let piece_end = piece_start + piece.data.len() as u64;

        let overlap_start = piece_start.max(target.start_byte);
        let overlap_end = piece_end.min(target.end_byte);
        if overlap_start >= overlap_end {
            return Ok(());
        }

        let slice =
            &piece.data[(overlap_start - piece_start) as usize..(overlap_end - piece_start) as usize];
        let file_offset = overlap_start - target.start_byte;

        file.seek(SeekFrom::Start(file_offset)).await.map_err(|e| {
            EngineError::storage(path, format!("seek failed: {}", e))
        })?;
        file.write_all(slice).await.map_err(|e| {
            EngineError::storage(path, format!("write failed: {}", e))
        })?;
        Ok(())
    }
}

/// One peer's download task
struct Worker {
    addr: PeerAddr,
    info_hash: Sha1Hash,
    peer_id: [u8; 20],
    max_backlog: usize,
    dial_timeout: Duration,
    read_timeout: Duration,
    work_tx: WorkSender,
    work_rx: SharedWorkReceiver,
    done_tx: mpsc::UnboundedSender<PieceResult>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        if let Err(e) = self.run_inner().await {
            tracing::debug!(peer = %self.addr, error = %e, "worker exited");
        }
    }

    async fn run_inner(&self) -> Result<()> {
        let mut session = PeerSession::connect(
            self.addr.socket_addr(),
            self.info_hash,
            self.peer_id,
            self.dial_timeout,
            self.read_timeout,
        )
        .await?;

        session.express_interest().await?;

        loop {
            let piece = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                piece = async { self.work_rx.lock().await.recv().await } => piece,
            };
            let Some(piece) = piece else {
                // Queue closed and drained
                return Ok(());
            };

            if !session.has_piece(piece.index) {
                // Hand it back for a peer that has it; yield briefly so
                // this worker does not immediately re-take the same piece.
                self.requeue(piece);
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            }

            match self.download_piece(&mut session, &piece).await {
                Ok(data) => {
                    if verify_piece(&piece, &data) {
                        if self.done_tx.send(PieceResult {
                            index: piece.index,
                            data,
                        })
                        .is_err()
                        {
                            // Writer is gone; download finished or failed
                            return Ok(());
                        }
                    } else {
                        tracing::warn!(
                            peer = %self.addr,
                            piece = piece.index,
                            "piece failed SHA-1 verification, requeuing"
                        );
                        self.requeue(piece);
                    }
                }
                Err(e) => {
                    // Connection-level failure: return the piece and drop
                    // the peer.
                    self.requeue(piece);
                    return Err(e);
                }
            }
        }
    }

    fn requeue(&self, piece: PieceWork) {
        // Queue capacity equals the piece count, so this cannot fail while
        // the writer is alive; if it is gone the download is over anyway.
        let _ = self.work_tx.try_send(piece);
    }

    /// Fetch one piece, keeping up to `max_backlog` block requests in
    /// flight. Blocks are reconciled by their (index, begin) coordinates,
    /// not by arrival order.
    async fn download_piece(
        &self,
        session: &mut PeerSession,
        piece: &PieceWork,
    ) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; piece.length as usize];
        let mut downloaded: u64 = 0;
        let mut requested: u64 = 0;
        let mut backlog: usize = 0;

        while downloaded < piece.length {
            if !session.peer_choking() {
                while backlog < self.max_backlog && requested < piece.length {
                    let length = u64::from(MAX_BLOCK).min(piece.length - requested) as u32;
                    session
                        .send(PeerMessage::Request {
                            index: piece.index,
                            begin: requested as u32,
                            length,
                        })
                        .await?;
                    requested += u64::from(length);
                    backlog += 1;
                }
            }

            match session.recv().await? {
                PeerMessage::Piece {
                    index,
                    begin,
                    block,
                } => {
                    if index != piece.index {
                        return Err(block_error(format!(
                            "piece message for {} while downloading {}",
                            index, piece.index
                        )));
                    }
                    let begin = begin as usize;
                    if begin >= buf.len() || begin + block.len() > buf.len() {
                        return Err(block_error(format!(
                            "block [{}, {}) outside piece of {} bytes",
                            begin,
                            begin + block.len(),
                            buf.len()
                        )));
                    }

                    buf[begin..begin + block.len()].copy_from_slice(&block);
                    downloaded += block.len() as u64;
                    backlog = backlog.saturating_sub(1);
                }
                // Choke/interest/have/bitfield effects are applied inside
                // the session; everything else is ignorable.
                _ => {}
            }
        }

        Ok(buf)
    }
}

fn verify_piece(piece: &PieceWork, data: &[u8]) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let hash: Sha1Hash = hasher.finalize().into();
    hash == piece.hash
}

fn block_error(message: String) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::PeerProtocol, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_piece() {
        let data = b"hello piece data";
        let mut hasher = Sha1::new();
        hasher.update(data);
        let hash: Sha1Hash = hasher.finalize().into();

        let piece = PieceWork {
            index: 0,
            hash,
            length: data.len() as u64,
        };
        assert!(verify_piece(&piece, data));
        assert!(!verify_piece(&piece, b"corrupted  data!"));
    }

    #[test]
    fn test_block_sizing() {
        // 40000-byte piece: two full blocks and a 7232-byte tail
        let length: u64 = 40000;
        let mut requested = 0u64;
        let mut sizes = Vec::new();
        while requested < length {
            let block = u64::from(MAX_BLOCK).min(length - requested);
            sizes.push(block);
            requested += block;
        }
        assert_eq!(sizes, vec![16384, 16384, 7232]);
        assert_eq!(sizes.iter().sum::<u64>(), length);
    }
}
