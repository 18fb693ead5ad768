//! Torrent info dictionary
//!
//! Decodes the raw `info` dict obtained over the metadata extension and
//! derives the layout of the download target: the largest regular file in
//! the torrent ("the movie"), its window within the torrent's virtual byte
//! stream, and the piece indices covering it.

use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::torrent::bencode::BencodeValue;

/// SHA-1 hash (20 bytes)
pub type Sha1Hash = [u8; 20];

/// A file entry from the info dict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File size in bytes
    pub length: u64,
    /// Path segments relative to the torrent root
    pub path: Vec<String>,
}

/// Decoded info dictionary plus derived fields
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Suggested name of the torrent
    pub name: String,
    /// Bytes per piece (last piece may be shorter)
    pub piece_length: u64,
    /// One SHA-1 hash per piece, in index order
    pub piece_hashes: Vec<Sha1Hash>,
    /// Files in virtual-stream order; single-file torrents are normalized
    /// to a one-entry list
    pub files: Vec<FileEntry>,
    /// Total size of all files
    pub total_size: u64,
}

impl TorrentInfo {
    /// Decode a raw bencoded info dictionary.
    ///
    /// The caller is responsible for having verified `SHA1(data)` against
    /// the magnet's info hash before trusting the contents.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let value = BencodeValue::decode(data)?;
        let dict = value.as_dict().ok_or_else(|| {
            EngineError::protocol(ProtocolErrorKind::InvalidInfo, "info is not a dictionary")
        })?;

        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| missing_field("name"))?
            .to_string();

        let piece_length = value
            .get("piece length")
            .and_then(|v| v.as_uint())
            .ok_or_else(|| missing_field("piece length"))?;
        if piece_length == 0 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidInfo,
                "piece length must be greater than zero",
            ));
        }

        let pieces = value
            .get("pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| missing_field("pieces"))?;
        if pieces.is_empty() || pieces.len() % 20 != 0 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidInfo,
                format!("pieces length {} is not a multiple of 20", pieces.len()),
            ));
        }
        let piece_hashes: Vec<Sha1Hash> = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        // Multi-file torrents carry a 'files' list; single-file torrents a
        // top-level 'length'. Normalize both to a file list.
        let files = match dict.get(b"files".as_slice()) {
            Some(files_value) => parse_files(files_value)?,
            None => {
                let length = value
                    .get("length")
                    .and_then(|v| v.as_uint())
                    .ok_or_else(|| missing_field("length"))?;
                vec![FileEntry {
                    length,
                    path: vec![name.clone()],
                }]
            }
        };

        let total_size = files.iter().map(|f| f.length).sum();

        Ok(Self {
            name,
            piece_length,
            piece_hashes,
            files,
            total_size,
        })
    }

    /// Number of pieces in the whole torrent
    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Derive the download target: the largest file and its piece layout.
    /// Ties go to the earliest file in stream order.
    pub fn target(&self) -> Result<TargetFile> {
        let mut offset = 0u64;
        let mut best: Option<(u64, &FileEntry)> = None;
        for file in &self.files {
            if best.map_or(true, |(_, b)| file.length > b.length) {
                best = Some((offset, file));
            }
            offset += file.length;
        }

        let (start_byte, largest) = best.ok_or_else(|| {
            EngineError::protocol(ProtocolErrorKind::InvalidInfo, "torrent contains no files")
        })?;

        if largest.length == 0 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidInfo,
                "target file is empty",
            ));
        }

        let end_byte = start_byte + largest.length;
        let start_piece = (start_byte / self.piece_length) as u32;
        let end_piece = (end_byte / self.piece_length) as u32;
        let start_offset = start_byte % self.piece_length;
        let end_offset = end_byte % self.piece_length;

        // The hash list must cover every piece the target touches
        let last_touched = if end_offset > 0 { end_piece } else { end_piece.saturating_sub(1) };
        if (last_touched as usize) >= self.piece_hashes.len() {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidInfo,
                format!(
                    "target needs piece {} but only {} hashes present",
                    last_touched,
                    self.piece_hashes.len()
                ),
            ));
        }

        Ok(TargetFile {
            size: largest.length,
            path: largest.path.clone(),
            piece_length: self.piece_length,
            total_size: self.total_size,
            start_byte,
            end_byte,
            start_piece,
            end_piece,
            start_offset,
            end_offset,
        })
    }
}

fn parse_files(value: &BencodeValue) -> Result<Vec<FileEntry>> {
    let list = value.as_list().ok_or_else(|| {
        EngineError::protocol(ProtocolErrorKind::InvalidInfo, "'files' is not a list")
    })?;

    let mut files = Vec::with_capacity(list.len());
    for entry in list {
        let length = entry
            .get("length")
            .and_then(|v| v.as_uint())
            .ok_or_else(|| missing_field("files[].length"))?;

        let path = entry
            .get("path")
            .and_then(|v| v.as_list())
            .ok_or_else(|| missing_field("files[].path"))?
            .iter()
            .map(|segment| {
                segment
                    .as_str()
                    .map(String::from)
                    .ok_or_else(|| missing_field("files[].path segment"))
            })
            .collect::<Result<Vec<String>>>()?;

        if path.is_empty() {
            return Err(missing_field("files[].path segment"));
        }

        files.push(FileEntry { length, path });
    }

    if files.is_empty() {
        return Err(EngineError::protocol(
            ProtocolErrorKind::InvalidInfo,
            "'files' list is empty",
        ));
    }

    Ok(files)
}

fn missing_field(field: &str) -> EngineError {
    EngineError::protocol(
        ProtocolErrorKind::InvalidInfo,
        format!("missing or invalid '{}'", field),
    )
}

/// The largest file in the torrent and its piece window.
///
/// `[start_byte, end_byte)` is the file's window within the torrent's
/// virtual byte stream; `start_piece` is the first piece touching it and
/// `end_piece` the piece containing `end_byte` (inclusive when the end
/// falls mid-piece).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFile {
    pub size: u64,
    pub path: Vec<String>,
    pub piece_length: u64,
    /// Size of the whole torrent stream, which bounds the final piece
    pub total_size: u64,
    pub start_byte: u64,
    pub end_byte: u64,
    pub start_piece: u32,
    pub end_piece: u32,
    pub start_offset: u64,
    pub end_offset: u64,
}

impl TargetFile {
    /// Number of pieces covering the file.
    ///
    /// `end_piece - start_piece` alone undercounts by one whenever the file
    /// ends mid-piece, so the remainder piece is added back.
    pub fn num_pieces(&self) -> u32 {
        self.end_piece - self.start_piece + u32::from(self.end_offset > 0)
    }

    /// Wire size of piece `index`. Pieces are torrent-global units (their
    /// hashes cover the full stream), so every piece is `piece_length`
    /// except the stream's final piece, which carries the remainder.
    pub fn piece_size(&self, index: u32) -> u64 {
        let start = u64::from(index) * self.piece_length;
        debug_assert!(start < self.total_size);
        self.piece_length.min(self.total_size - start)
    }

    /// Last path segment; the on-disk file name
    pub fn file_name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or("movie")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::bencode::dict;

    fn info_bytes(files: &[(&str, u64)], piece_length: u64, num_hashes: usize) -> Vec<u8> {
        let file_list: Vec<BencodeValue> = files
            .iter()
            .map(|(name, length)| {
                dict([
                    ("length", BencodeValue::Integer(*length as i64)),
                    (
                        "path",
                        BencodeValue::List(vec![BencodeValue::Bytes(name.as_bytes().to_vec())]),
                    ),
                ])
            })
            .collect();

        dict([
            ("files", BencodeValue::List(file_list)),
            ("name", BencodeValue::Bytes(b"test-torrent".to_vec())),
            (
                "piece length",
                BencodeValue::Integer(piece_length as i64),
            ),
            (
                "pieces",
                BencodeValue::Bytes(vec![0xAB; 20 * num_hashes]),
            ),
        ])
        .encode()
    }

    #[test]
    fn test_decode_multi_file() {
        let data = info_bytes(&[("a.nfo", 100), ("b.mkv", 5000)], 1024, 5);
        let info = TorrentInfo::from_bytes(&data).unwrap();

        assert_eq!(info.name, "test-torrent");
        assert_eq!(info.piece_length, 1024);
        assert_eq!(info.num_pieces(), 5);
        assert_eq!(info.files.len(), 2);
        assert_eq!(info.total_size, 5100);
    }

    #[test]
    fn test_single_file_normalized() {
        let data = dict([
            ("length", BencodeValue::Integer(2048)),
            ("name", BencodeValue::Bytes(b"solo.mkv".to_vec())),
            ("piece length", BencodeValue::Integer(1024)),
            ("pieces", BencodeValue::Bytes(vec![0; 40])),
        ])
        .encode();

        let info = TorrentInfo::from_bytes(&data).unwrap();
        assert_eq!(info.files.len(), 1);
        assert_eq!(info.files[0].path, vec!["solo.mkv".to_string()]);
        assert_eq!(info.files[0].length, 2048);

        let target = info.target().unwrap();
        assert_eq!(target.start_piece, 0);
        assert_eq!(target.num_pieces(), 2);
        assert_eq!(target.file_name(), "solo.mkv");
    }

    #[test]
    fn test_target_is_largest_file() {
        // 1000 + 5000 + 200 bytes, pieces of 1024
        let data = info_bytes(&[("a", 1000), ("big.mkv", 5000), ("c", 200)], 1024, 7);
        let info = TorrentInfo::from_bytes(&data).unwrap();
        let target = info.target().unwrap();

        assert_eq!(target.size, 5000);
        assert_eq!(target.file_name(), "big.mkv");
        assert_eq!(target.start_byte, 1000);
        assert_eq!(target.end_byte, 6000);
        assert_eq!(target.start_piece, 0);
        assert_eq!(target.start_offset, 1000);
        // 6000 / 1024 = 5, remainder 880 -> pieces 0..=5, six pieces
        assert_eq!(target.end_piece, 5);
        assert_eq!(target.end_offset, 6000 % 1024);
        assert_eq!(target.num_pieces(), 6);
    }

    #[test]
    fn test_num_pieces_when_end_is_aligned() {
        // Movie of exactly 4 pieces starting at a piece boundary
        let data = info_bytes(&[("pad", 1024), ("movie.mkv", 4096)], 1024, 5);
        let info = TorrentInfo::from_bytes(&data).unwrap();
        let target = info.target().unwrap();

        assert_eq!(target.start_piece, 1);
        assert_eq!(target.end_piece, 5);
        assert_eq!(target.end_offset, 0);
        // end aligned: no remainder piece
        assert_eq!(target.num_pieces(), 4);
    }

    #[test]
    fn test_piece_size() {
        let data = info_bytes(&[("pad", 1024), ("movie.mkv", 2500)], 1024, 4);
        let info = TorrentInfo::from_bytes(&data).unwrap();
        let target = info.target().unwrap();

        assert_eq!(target.start_piece, 1);
        assert_eq!(target.num_pieces(), 3);
        assert_eq!(target.piece_size(1), 1024);
        assert_eq!(target.piece_size(2), 1024);
        assert_eq!(target.piece_size(3), 452); // 2500 - 2048
    }

    #[test]
    fn test_invalid_info_rejected() {
        // Not a dict
        assert!(TorrentInfo::from_bytes(b"i42e").is_err());

        // Pieces not a multiple of 20
        let data = dict([
            ("length", BencodeValue::Integer(100)),
            ("name", BencodeValue::Bytes(b"x".to_vec())),
            ("piece length", BencodeValue::Integer(1024)),
            ("pieces", BencodeValue::Bytes(vec![0; 19])),
        ])
        .encode();
        assert!(TorrentInfo::from_bytes(&data).is_err());

        // Zero piece length
        let data = dict([
            ("length", BencodeValue::Integer(100)),
            ("name", BencodeValue::Bytes(b"x".to_vec())),
            ("piece length", BencodeValue::Integer(0)),
            ("pieces", BencodeValue::Bytes(vec![0; 20])),
        ])
        .encode();
        assert!(TorrentInfo::from_bytes(&data).is_err());
    }

    #[test]
    fn test_too_few_hashes_rejected() {
        // Movie needs 3 pieces but only 2 hashes present
        let data = info_bytes(&[("movie.mkv", 2500)], 1024, 2);
        let info = TorrentInfo::from_bytes(&data).unwrap();
        assert!(info.target().is_err());
    }
}
