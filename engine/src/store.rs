use core::panic;
use std::{path::PathBuf, ops::Range};
use serde_derive::{Deserialize, Serialize};
use crate::metainfo::MetaInfo;

// File information deserialised from metainfo.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename = "File")]
pub struct FileInfo {

    // A list containing one or more string elements that together represent the path and filename
    #[serde(deserialize_with = "crate::de::path_deserialize")]
    pub path: PathBuf,
    
    // Length of the file in bytes (integer)
    pub length: usize,
    
    // Offset in bytes from start of torrent when viewed as single array.
    #[serde(skip)]
    pub offset: usize,

    // A 32-character hexadecimal string corresponding to the MD5 sum of the file
    #[serde(default)]
    pub md5sum: Option<String>,

}

impl FileInfo {
    // Byte index range for whole torrent.
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..(self.offset + self.length)
    }

    pub fn last_byte(&self) -> usize {
        self.offset + self.length
    }
}

// Contains general information on torrage storage.
#[derive(Debug, Clone)]
pub struct StoreInfo {

    // Length of torrent in bytes.
    pub total_len: u64,

    // Length of pieces in bytes.
    pub piece_len: usize,

    // Length of the last piece, will be < piece_length.
    pub last_piece_len: usize,

    // Number of pieces in torrent.
    pub num_pieces: u32,

    // File contained in torrent.
    pub files: Vec<FileInfo>,

    // Directory to store downloaded files.
    pub output_dir: PathBuf,

}

impl StoreInfo {

    pub fn new(metainfo: &MetaInfo, output_dir: PathBuf) -> Self {
        
        let total_len = metainfo.total_len();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_len();
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;
        let files = metainfo.files();
        let output_dir = if metainfo.is_multi_file() {
            output_dir.join(metainfo.name())
        } else {
            output_dir
        };

        Self {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            files,
            output_dir,
        }
    }

    // Returns length of piece given its index.
    pub fn piece_length(&self, idx: usize) -> usize {
        if idx as u32 == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_total_offset(&self, piece_idx: usize) -> usize {
        piece_idx * self.piece_len
    }

    // Returns the indexes of the first and last file that a piece intersects.
    pub fn piece_file_intersections(&self, piece_idx: usize) -> Range<usize> {
        debug_assert!(piece_idx < self.num_pieces as usize, "piece index out of bounds");

        // If only one file, there are no intersections to compute.
        if self.files.len() == 1 {
            return 0..1;
        }

        let offset = piece_idx * self.piece_len;
        let end = offset + self.piece_length(piece_idx);

        let start_file = match self.files
            .iter()
            .enumerate()
            .find(|(_, f)| f.byte_range().contains(&offset))
        {
            Some((idx, _)) => idx,
            None => panic!("piece byte offset exceeds file length"),   
        };

        let end_file = match self.files[start_file..]
            .iter()
            .enumerate()
            .find(|(_, f)| f.byte_range().contains(&(end - 1)))
        {
            Some((idx, _)) => start_file + idx,
            None => panic!("piece last byte exceeds torrent length"),
        };

        start_file..(end_file + 1)
    }

    // Returns the range of piece indexes that a file spans. Inverse of
    // `piece_file_intersections`, used to apply a per-file priority to
    // every piece it touches.
    pub fn file_piece_range(&self, file_idx: usize) -> Range<usize> {
        let file = &self.files[file_idx];
        let byte_range = file.byte_range();
        let start = byte_range.start / self.piece_len;
        let end = (byte_range.end - 1) / self.piece_len;
        start..(end + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(lengths: &[usize]) -> Vec<FileInfo> {
        let mut offset = 0;
        lengths.iter().map(|&length| {
            let info = FileInfo { path: PathBuf::from("f"), length, offset, md5sum: None };
            offset += length;
            info
        }).collect()
    }

    #[test]
    fn byte_range_is_half_open() {
        let f = FileInfo { path: PathBuf::from("a"), length: 10, offset: 5, md5sum: None };
        assert_eq!(f.byte_range(), 5..15);
        assert!(!f.byte_range().contains(&15));
    }

    #[test]
    fn piece_file_intersections_single_file() {
        let info = StoreInfo {
            total_len: 100,
            piece_len: 32,
            last_piece_len: 4,
            num_pieces: 4,
            files: files(&[100]),
            output_dir: PathBuf::from("out"),
        };
        assert_eq!(info.piece_file_intersections(0), 0..1);
        assert_eq!(info.piece_file_intersections(3), 0..1);
    }

    #[test]
    fn piece_file_intersections_spans_multiple_files() {
        // Files of length 10 and 90; a 32-byte piece starting at offset 0
        // spans both, a piece entirely within the second file does not.
        let info = StoreInfo {
            total_len: 100,
            piece_len: 32,
            last_piece_len: 4,
            num_pieces: 4,
            files: files(&[10, 90]),
            output_dir: PathBuf::from("out"),
        };
        assert_eq!(info.piece_file_intersections(0), 0..2);
        assert_eq!(info.piece_file_intersections(1), 1..2);
    }

    #[test]
    fn file_piece_range_is_inverse_of_piece_file_intersections() {
        let info = StoreInfo {
            total_len: 100,
            piece_len: 32,
            last_piece_len: 4,
            num_pieces: 4,
            files: files(&[10, 90]),
            output_dir: PathBuf::from("out"),
        };
        assert_eq!(info.file_piece_range(0), 0..1);
        assert_eq!(info.file_piece_range(1), 0..4);
    }
}