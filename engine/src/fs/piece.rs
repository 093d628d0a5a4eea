use std::{io::{Seek, SeekFrom, Write}, ops::Range, sync::RwLock};
use sha1::{Digest, Sha1};
use super::{Result, TorrentFile};

// Accumulates blocks for a single piece until all have arrived, then
// verifies and writes the whole piece to disk in one pass.
#[derive(Debug)]
pub struct Piece {

    pub hash: [u8; 20],

    pub length: usize,

    pub data: Vec<u8>,

    pub blocks_received: Vec<bool>,

    pub num_blocks_received: usize,

    // Range into the torrent's file list that this piece overlaps.
    pub file_overlap: Range<usize>,
}

impl Piece {

    pub fn add_block(&mut self, offset: usize, data: Vec<u8>) {
        let block_idx = offset / crate::BLOCK_SIZE;
        if self.blocks_received[block_idx] {
            tracing::warn!("duplicate block at offset {}", offset);
            return;
        }
        self.data[offset..offset + data.len()].copy_from_slice(&data);
        self.blocks_received[block_idx] = true;
        self.num_blocks_received += 1;
    }

    pub fn verify_hash(&self) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        hasher.finalize().as_slice() == self.hash
    }

    pub fn write(&self, piece_offset: usize, files: &[RwLock<TorrentFile>]) -> Result<()> {
        let files = &files[self.file_overlap.clone()];
        let mut written = 0;
        let mut offset = piece_offset;

        for file in files {
            let mut f = file.write()?;
            let byte_range = f.info.byte_range();
            let file_offset = offset - byte_range.start;
            let remaining_in_piece = self.length - written;
            let remaining_in_file = byte_range.end - offset;
            let n = remaining_in_piece.min(remaining_in_file);

            f.handle.seek(SeekFrom::Start(file_offset as u64))?;
            f.handle.write_all(&self.data[written..written + n])?;

            written += n;
            offset += n;
        }
        debug_assert_eq!(written, self.length);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[test]
    fn add_block_fills_in_place_and_counts_received() {
        let length = crate::BLOCK_SIZE * 2;
        let mut piece = Piece {
            hash: [0; 20],
            length,
            data: vec![0; length],
            blocks_received: vec![false; 2],
            num_blocks_received: 0,
            file_overlap: 0..1,
        };
        piece.add_block(crate::BLOCK_SIZE, vec![7; crate::BLOCK_SIZE]);
        assert_eq!(piece.num_blocks_received, 1);
        assert!(piece.data[crate::BLOCK_SIZE..].iter().all(|&b| b == 7));
        assert!(piece.data[..crate::BLOCK_SIZE].iter().all(|&b| b == 0));
    }

    #[test]
    fn verify_hash_matches_expected_digest() {
        let data = vec![1, 2, 3, 4, 5];
        let piece = Piece {
            hash: sha1(&data),
            length: data.len(),
            data,
            blocks_received: vec![true],
            num_blocks_received: 1,
            file_overlap: 0..1,
        };
        assert!(piece.verify_hash());
    }

    #[test]
    fn verify_hash_rejects_corrupted_data() {
        let piece = Piece {
            hash: sha1(b"expected"),
            length: 7,
            data: b"corrupt".to_vec(),
            blocks_received: vec![true],
            num_blocks_received: 1,
            file_overlap: 0..1,
        };
        assert!(!piece.verify_hash());
    }
}
